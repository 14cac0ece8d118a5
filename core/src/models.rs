use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::LarderError;

/// Fractional digits kept for every stored amount.
pub const AMOUNT_SCALE: u32 = 2;

/// Largest storable amount (99999999.99) in hundredths. Stored sums are held
/// to the same bound.
pub const MAX_AMOUNT_HUNDREDTHS: i64 = 9_999_999_999;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub category_id: Option<i64>,
    // Joined field for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewIngredient {
    pub name: String,
    pub unit: Option<String>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recipe {
    pub id: i64,
    pub name: String,
    pub instructions: Option<String>,
    pub image_url: Option<String>,
    pub ingredient_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeDetail {
    pub id: i64,
    pub name: String,
    pub instructions: Option<String>,
    pub image_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub ingredients: Vec<RecipeIngredient>,
}

/// An ingredient line of a recipe, joined with the ingredient for display.
#[derive(Debug, Clone, Serialize)]
pub struct RecipeIngredient {
    pub ingredient_id: i64,
    pub name: String,
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipeLine {
    pub ingredient_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipe {
    pub name: String,
    pub instructions: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<NewRecipeLine>,
}

/// A recipe line that names its ingredient instead of referencing it, as
/// read from an imported recipe file.
#[derive(Debug, Clone)]
pub struct ImportedLine {
    pub name: String,
    pub unit: Option<String>,
    pub amount: Decimal,
}

/// Raw `(recipe, ingredient, amount)` triple as read by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngredientLine {
    pub recipe_id: i64,
    pub ingredient_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShoppingListItem {
    pub id: i64,
    pub ingredient_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub amount: Decimal,
    /// Effective unit: the row's override, else the ingredient's default.
    pub unit: Option<String>,
    pub is_checked: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateShoppingListItem {
    pub amount: Option<Decimal>,
    pub is_checked: Option<bool>,
}

/// Outcome of a manual add: a fresh row, or an accumulation into an open one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Created,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedItem {
    pub outcome: AddOutcome,
    pub item: ShoppingListItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    /// Distinct recipe ids in the selection, known or not.
    pub recipes: usize,
    /// Shopping list rows inserted or accumulated.
    pub ingredients: usize,
}

// --- Amount helpers ---

/// Round to the stored scale and convert to integer hundredths.
pub fn amount_to_hundredths(amount: Decimal) -> Result<i64> {
    let rounded = amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|h| h.to_i64())
        .filter(|h| (-MAX_AMOUNT_HUNDREDTHS..=MAX_AMOUNT_HUNDREDTHS).contains(h))
        .ok_or_else(|| {
            LarderError::validation(format!(
                "Amount {amount} is out of range (at most {})",
                max_amount()
            ))
        })
}

pub fn amount_from_hundredths(hundredths: i64) -> Decimal {
    Decimal::new(hundredths, AMOUNT_SCALE)
}

pub fn max_amount() -> Decimal {
    amount_from_hundredths(MAX_AMOUNT_HUNDREDTHS)
}

/// The list total for `ingredient_id` would leave the storable range.
pub fn list_amount_overflow(ingredient_id: i64) -> anyhow::Error {
    LarderError::conflict(format!(
        "Shopping list amount for ingredient {ingredient_id} would exceed {}",
        max_amount()
    ))
}

// --- Validation ---

pub fn validate_name<'a>(kind: &str, name: &'a str) -> Result<&'a str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(LarderError::validation(format!("{kind} name must not be empty")));
    }
    Ok(trimmed)
}

/// Amounts on recipe lines and manual additions must be strictly positive
/// once rounded to the stored scale.
pub fn validate_positive_amount(amount: Decimal) -> Result<i64> {
    let hundredths = amount_to_hundredths(amount)?;
    if hundredths <= 0 {
        return Err(LarderError::validation("amount must be greater than 0"));
    }
    Ok(hundredths)
}

/// Manual edits may zero an amount but never make it negative.
pub fn validate_non_negative_amount(amount: Decimal) -> Result<i64> {
    let hundredths = amount_to_hundredths(amount)?;
    if hundredths < 0 {
        return Err(LarderError::validation("amount must not be negative"));
    }
    Ok(hundredths)
}

/// Normalise an optional unit: blank strings mean "no unit".
pub fn normalize_unit(unit: Option<&str>) -> Option<String> {
    unit.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(String::from)
}
