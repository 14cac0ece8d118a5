use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::db::Database;
use larder_core::models::Category;

use super::helpers::{exit_empty, truncate};

fn print_category_table(categories: &[Category]) {
    #[derive(Tabled)]
    struct CategoryRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Order")]
        sort_order: i64,
    }

    let rows: Vec<CategoryRow> = categories
        .iter()
        .map(|c| CategoryRow {
            id: c.id,
            name: truncate(&c.name, 30),
            sort_order: c.sort_order,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn cmd_category_list(db: &Database, json: bool) -> Result<()> {
    let categories = db.list_categories()?;
    if categories.is_empty() {
        exit_empty(json, "No categories yet. Add one with: larder category add <name>");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else {
        print_category_table(&categories);
    }
    Ok(())
}

pub(crate) fn cmd_category_add(db: &Database, name: &str, json: bool) -> Result<()> {
    let category = db.create_category(name)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&category)?);
    } else {
        println!(
            "Created category: {} (id: {}, position: {})",
            category.name, category.id, category.sort_order
        );
    }
    Ok(())
}

pub(crate) fn cmd_category_reorder(db: &Database, ordered_ids: &[i64], json: bool) -> Result<()> {
    db.reorder_categories(ordered_ids)?;
    let categories = db.list_categories()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else {
        print_category_table(&categories);
    }
    Ok(())
}

pub(crate) fn cmd_category_delete(db: &Database, id: i64, json: bool) -> Result<()> {
    db.delete_category(id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted category {id}");
    }
    Ok(())
}
