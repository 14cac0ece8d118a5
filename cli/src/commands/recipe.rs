use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use std::path::Path;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::db::Database;
use larder_core::models::{ImportedLine, NewRecipe, RecipeDetail};

use super::helpers::{exit_empty, exit_not_found, format_amount, parse_recipe_line, truncate};

pub(crate) fn cmd_recipe_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Ingredients")]
        ingredients: i64,
    }

    let recipes = db.list_recipes()?;
    if recipes.is_empty() {
        exit_empty(json, "No recipes found");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&recipes)?);
        return Ok(());
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id,
            name: truncate(&r.name, 40),
            ingredients: r.ingredient_count,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

fn print_recipe_detail(detail: &RecipeDetail) {
    println!("=== {} ===", detail.name);
    if let Some(url) = &detail.image_url {
        println!("  Image: {url}");
    }

    println!("\n  INGREDIENTS:");
    if detail.ingredients.is_empty() {
        println!("    (none)");
    }
    for ing in &detail.ingredients {
        let amount = format_amount(ing.amount, ing.unit.as_deref());
        println!("    {} ({}): {amount}", ing.name, ing.ingredient_id);
    }

    if let Some(instructions) = &detail.instructions {
        println!("\n  INSTRUCTIONS:");
        for line in instructions.lines() {
            println!("    {line}");
        }
    }
}

pub(crate) fn cmd_recipe_show(db: &Database, id: i64, json: bool) -> Result<()> {
    let detail = db.get_recipe_detail(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        print_recipe_detail(&detail);
    }
    Ok(())
}

pub(crate) fn cmd_recipe_create(
    db: &Database,
    name: &str,
    instructions: Option<String>,
    lines: &[String],
    json: bool,
) -> Result<()> {
    let ingredients = lines
        .iter()
        .map(|l| parse_recipe_line(l))
        .collect::<Result<Vec<_>>>()?;

    let detail = db.create_recipe(&NewRecipe {
        name: name.to_string(),
        instructions,
        image_url: None,
        ingredients,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        let count = detail.ingredients.len();
        println!("Created recipe: {} (id: {}, {count} ingredients)", detail.name, detail.id);
    }
    Ok(())
}

pub(crate) fn cmd_recipe_delete(db: &Database, id: i64, json: bool) -> Result<()> {
    if !db.delete_recipe(id)? {
        exit_not_found(json, &format!("Recipe {id} not found"));
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted recipe {id}");
    }
    Ok(())
}

pub(crate) fn cmd_recipe_import(
    db: &Database,
    file: &Path,
    name_override: Option<String>,
    json: bool,
) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    let fallback_name = file.file_stem().and_then(|s| s.to_str());
    let detail = import_cooklang(db, &input, name_override, fallback_name)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        let count = detail.ingredients.len();
        println!(
            "Imported recipe: {} (id: {}, {count} ingredients)",
            detail.name, detail.id
        );
    }
    Ok(())
}

/// Parse Cooklang source and store it as a recipe. Ingredients are matched
/// against the catalogue by name and created when missing, in the same
/// transaction as the recipe.
fn import_cooklang(
    db: &Database,
    input: &str,
    name_override: Option<String>,
    fallback_name: Option<&str>,
) -> Result<RecipeDetail> {
    let (recipe_data, _report) = cooklang::parse(input)
        .into_result()
        .map_err(|e| anyhow::anyhow!("Failed to parse Cooklang file: {e}"))?;

    let name = name_override
        .or_else(|| recipe_data.metadata.title().map(String::from))
        .or_else(|| fallback_name.map(String::from))
        .context("Could not determine recipe name. Use --name to specify one")?;

    let converter = cooklang::Converter::default();
    let grouped = recipe_data.group_ingredients(&converter);
    if grouped.is_empty() {
        bail!("No ingredients found in recipe");
    }

    // The same ingredient can appear in several groups when units differ;
    // the store sums them.
    let lines: Vec<ImportedLine> = grouped.iter().map(imported_line).collect();
    db.import_recipe(&name, None, &lines)
}

fn imported_line(gi: &cooklang::ingredient_list::GroupedIngredient<'_>) -> ImportedLine {
    let (value, unit) =
        gi.quantity
            .iter()
            .next()
            .map_or((None, None), |qty: &cooklang::Quantity| {
                let value = match qty.value() {
                    cooklang::Value::Number(n) => Some(n.value()),
                    cooklang::Value::Range { start, .. } => Some(start.value()),
                    cooklang::Value::Text(_) => None,
                };
                (value, qty.unit().map(String::from))
            });

    // Text quantities ("a pinch") and missing ones count as a single unit
    let amount = value
        .and_then(|v| Decimal::try_from(v).ok())
        .map(|d| d.round_dp(2))
        .filter(|d| *d > Decimal::ZERO)
        .unwrap_or(Decimal::ONE);

    ImportedLine {
        name: gi.ingredient.display_name().to_string(),
        unit,
        amount,
    }
}
