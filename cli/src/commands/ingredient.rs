use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::db::Database;
use larder_core::models::{Ingredient, NewIngredient};

use super::helpers::{exit_empty, truncate};

pub(crate) fn cmd_ingredient_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct IngredientRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Category")]
        category: String,
    }

    let ingredients = db.list_ingredients()?;
    if ingredients.is_empty() {
        exit_empty(json, "No ingredients yet. Add one with: larder ingredient add <name>");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&ingredients)?);
        return Ok(());
    }

    let rows: Vec<IngredientRow> = ingredients
        .iter()
        .map(|i| IngredientRow {
            id: i.id,
            name: truncate(&i.name, 30),
            unit: i.unit.clone().unwrap_or_default(),
            category: i
                .category
                .as_deref()
                .map_or_else(|| "-".into(), |c| truncate(c, 20)),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(0)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

fn print_ingredient(verb: &str, ingredient: &Ingredient) {
    let name = &ingredient.name;
    let id = ingredient.id;
    let unit = ingredient.unit.as_deref().unwrap_or("no unit");
    let category = ingredient.category.as_deref().unwrap_or("uncategorised");
    println!("{verb} ingredient: {name} (id: {id}, {unit}, {category})");
}

pub(crate) fn cmd_ingredient_add(
    db: &Database,
    name: &str,
    unit: Option<String>,
    category_id: Option<i64>,
    json: bool,
) -> Result<()> {
    let ingredient = db.create_ingredient(&NewIngredient {
        name: name.to_string(),
        unit,
        category_id,
    })?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ingredient)?);
    } else {
        print_ingredient("Created", &ingredient);
    }
    Ok(())
}

pub(crate) fn cmd_ingredient_update(
    db: &Database,
    id: i64,
    name: &str,
    unit: Option<String>,
    category_id: Option<i64>,
    json: bool,
) -> Result<()> {
    let ingredient = db.update_ingredient(
        id,
        &NewIngredient {
            name: name.to_string(),
            unit,
            category_id,
        },
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ingredient)?);
    } else {
        print_ingredient("Updated", &ingredient);
    }
    Ok(())
}

pub(crate) fn cmd_ingredient_delete(db: &Database, id: i64, json: bool) -> Result<()> {
    db.delete_ingredient(id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted ingredient {id}");
    }
    Ok(())
}
