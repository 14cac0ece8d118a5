use anyhow::Result;
use rust_decimal::Decimal;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::db::Database;
use larder_core::models::{AddOutcome, ShoppingListItem, UpdateShoppingListItem};
use larder_core::shopping::{NoopNotifier, generate_from_selection};

use super::helpers::{exit_empty, exit_not_found, format_amount, truncate};

pub(crate) fn cmd_list_show(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "")]
        checked: &'static str,
        #[tabled(rename = "Ingredient")]
        name: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Amount")]
        amount: String,
    }

    let items = db.list_shopping_list()?;
    if items.is_empty() {
        exit_empty(json, "Shopping list is empty");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    let rows: Vec<ItemRow> = items
        .iter()
        .map(|item| ItemRow {
            id: item.id,
            checked: if item.is_checked { "[x]" } else { "[ ]" },
            name: truncate(&item.name, 30),
            category: item
                .category
                .as_deref()
                .map_or_else(|| "-".into(), |c| truncate(c, 20)),
            amount: format_amount(item.amount, item.unit.as_deref()),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    let open = items.iter().filter(|i| !i.is_checked).count();
    println!("{open} of {} items still to buy", items.len());

    Ok(())
}

fn print_item(verb: &str, item: &ShoppingListItem) {
    let amount = format_amount(item.amount, item.unit.as_deref());
    let state = if item.is_checked { "checked" } else { "open" };
    println!("{verb} {}: {amount} ({state}, item id: {})", item.name, item.id);
}

pub(crate) fn cmd_list_add(
    db: &Database,
    ingredient_id: i64,
    amount: Decimal,
    unit: Option<&str>,
    json: bool,
) -> Result<()> {
    let added = db.add_shopping_list_item(ingredient_id, amount, unit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&added)?);
    } else {
        let verb = match added.outcome {
            AddOutcome::Created => "Added",
            AddOutcome::Merged => "Merged into",
        };
        print_item(verb, &added.item);
    }
    Ok(())
}

pub(crate) fn cmd_list_update(
    db: &Database,
    id: i64,
    update: &UpdateShoppingListItem,
    json: bool,
) -> Result<()> {
    let item = db.update_shopping_list_item(id, update)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        print_item("Updated", &item);
    }
    Ok(())
}

pub(crate) fn cmd_list_remove(db: &Database, id: i64, json: bool) -> Result<()> {
    if !db.delete_shopping_list_item(id)? {
        exit_not_found(json, &format!("Shopping list item {id} not found"));
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Removed item {id}");
    }
    Ok(())
}

pub(crate) fn cmd_list_clear_checked(db: &Database, json: bool) -> Result<()> {
    let removed = db.clear_checked_items()?;
    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {removed} checked item(s)");
    }
    Ok(())
}

pub(crate) fn cmd_list_generate(db: &Database, recipe_ids: &[i64], json: bool) -> Result<()> {
    let summary = generate_from_selection(db, &NoopNotifier, recipe_ids)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Merged {} ingredient(s) from {} recipe(s) into the shopping list",
            summary.ingredients, summary.recipes
        );
    }
    Ok(())
}
