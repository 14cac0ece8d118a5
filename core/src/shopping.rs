//! Shopping list generation: turning a recipe selection into list rows.
//!
//! A selection is a multiset of recipe ids. Every recipe contributes its
//! ingredient lines once per occurrence, amounts are summed per ingredient,
//! and the totals are merged into the persistent list by the store.

use std::collections::BTreeMap;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::LarderError;
use crate::models::{GenerationSummary, IngredientLine, list_amount_overflow};

/// Change events observers of the shopping list can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEvent {
    ShoppingListUpdated,
}

impl ListEvent {
    /// Name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            ListEvent::ShoppingListUpdated => "shopping_list_updated",
        }
    }
}

/// Receives list change events once a mutation has been committed.
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, event: ListEvent);
}

/// Notifier for contexts with nobody listening, such as one-shot CLI commands.
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn publish(&self, _event: ListEvent) {}
}

/// Count how many times each recipe id occurs in the selection.
pub fn selection_counts(recipe_ids: &[i64]) -> Result<BTreeMap<i64, u32>> {
    if recipe_ids.is_empty() {
        return Err(LarderError::validation("recipeIds must be a non-empty list"));
    }
    let mut counts = BTreeMap::new();
    for &id in recipe_ids {
        *counts.entry(id).or_insert(0u32) += 1;
    }
    Ok(counts)
}

/// Sum `amount * count(recipe)` per ingredient. Lines of recipes missing from
/// `counts` are ignored. Keys come out in ascending ingredient id order.
pub fn aggregate_lines(
    lines: &[IngredientLine],
    counts: &BTreeMap<i64, u32>,
) -> Result<BTreeMap<i64, Decimal>> {
    let mut totals: BTreeMap<i64, Decimal> = BTreeMap::new();
    for line in lines {
        let Some(&count) = counts.get(&line.recipe_id) else {
            continue;
        };
        let total = totals.entry(line.ingredient_id).or_insert(Decimal::ZERO);
        let current = *total;
        *total = line
            .amount
            .checked_mul(Decimal::from(count))
            .and_then(|contribution| current.checked_add(contribution))
            .ok_or_else(|| list_amount_overflow(line.ingredient_id))?;
    }
    Ok(totals)
}

/// Validate a selection, merge it into the list, then notify observers.
///
/// Nothing is published when validation or persistence fails.
pub fn generate_from_selection(
    db: &Database,
    notifier: &dyn ChangeNotifier,
    recipe_ids: &[i64],
) -> Result<GenerationSummary> {
    let counts = selection_counts(recipe_ids)?;
    debug!(selected = recipe_ids.len(), distinct = counts.len(), "generating shopping list");

    let summary = db.generate_shopping_list(&counts)?;
    notifier.publish(ListEvent::ShoppingListUpdated);

    info!(
        recipes = summary.recipes,
        ingredients = summary.ingredients,
        "shopping list generated"
    );
    Ok(summary)
}
