use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter};
use tracing::debug;

use crate::error::LarderError;
use crate::models::{
    AddOutcome, AddedItem, Category, GenerationSummary, ImportedLine, Ingredient, IngredientLine,
    MAX_AMOUNT_HUNDREDTHS, NewIngredient, NewRecipe, Recipe, RecipeDetail, RecipeIngredient,
    ShoppingListItem, UpdateShoppingListItem, amount_from_hundredths, amount_to_hundredths,
    list_amount_overflow, normalize_unit, validate_name, validate_non_negative_amount,
    validate_positive_amount,
};
use crate::shopping::aggregate_lines;

/// How long a writer waits for another connection's write transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SHOPPING_LIST_SELECT: &str = "SELECT sli.id, sli.ingredient_id, i.name, c.name,
        sli.amount_hundredths, COALESCE(sli.unit, i.unit), sli.is_checked, sli.updated_at
     FROM shopping_list_items sli
     JOIN ingredients i ON sli.ingredient_id = i.id
     LEFT JOIN categories c ON i.category_id = c.id";

const INGREDIENT_SELECT: &str = "SELECT i.id, i.name, i.unit, i.category_id, c.name
     FROM ingredients i
     LEFT JOIN categories c ON i.category_id = c.id";

// Categorised first in category order, uncategorised last.
const CATEGORY_ORDER: &str = "(c.sort_order IS NULL), c.sort_order, i.name";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            // Amounts are stored as integer hundredths so SQL-side accumulation is exact.
            // The typeof() checks reject sums SQLite would otherwise widen to REAL.
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    sort_order INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS ingredients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    unit TEXT,
                    category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    instructions TEXT,
                    image_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    ingredient_id INTEGER NOT NULL REFERENCES ingredients(id) ON DELETE CASCADE,
                    amount_hundredths INTEGER NOT NULL CHECK (
                        typeof(amount_hundredths) = 'integer'
                        AND amount_hundredths BETWEEN 1 AND {max}
                    ),
                    PRIMARY KEY (recipe_id, ingredient_id)
                );

                CREATE TABLE IF NOT EXISTS shopping_list_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ingredient_id INTEGER NOT NULL UNIQUE REFERENCES ingredients(id) ON DELETE CASCADE,
                    amount_hundredths INTEGER NOT NULL CHECK (
                        typeof(amount_hundredths) = 'integer'
                        AND amount_hundredths BETWEEN 0 AND {max}
                    ),
                    is_checked INTEGER NOT NULL DEFAULT 0,
                    unit TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_ingredients_category ON ingredients(category_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_ingredient ON recipe_ingredients(ingredient_id);

                PRAGMA user_version = 1;",
                max = MAX_AMOUNT_HUNDREDTHS,
            ))?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn category_from_row(row: &rusqlite::Row) -> rusqlite::Result<Category> {
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            sort_order: row.get(2)?,
        })
    }

    // Expects INGREDIENT_SELECT column order.
    fn ingredient_from_row(row: &rusqlite::Row) -> rusqlite::Result<Ingredient> {
        Ok(Ingredient {
            id: row.get(0)?,
            name: row.get(1)?,
            unit: row.get(2)?,
            category_id: row.get(3)?,
            category: row.get(4)?,
        })
    }

    // Expects SHOPPING_LIST_SELECT column order.
    fn shopping_item_from_row(row: &rusqlite::Row) -> rusqlite::Result<ShoppingListItem> {
        Ok(ShoppingListItem {
            id: row.get(0)?,
            ingredient_id: row.get(1)?,
            name: row.get(2)?,
            category: row.get(3)?,
            amount: amount_from_hundredths(row.get(4)?),
            unit: row.get(5)?,
            is_checked: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
        Ok(Recipe {
            id: row.get(0)?,
            name: row.get(1)?,
            instructions: row.get(2)?,
            image_url: row.get(3)?,
            ingredient_count: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // --- Categories ---

    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, sort_order FROM categories ORDER BY sort_order, id")?;
        let categories = stmt
            .query_map([], Self::category_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    pub fn get_category(&self, id: i64) -> Result<Category> {
        self.conn
            .query_row(
                "SELECT id, name, sort_order FROM categories WHERE id = ?1",
                params![id],
                Self::category_from_row,
            )
            .optional()?
            .ok_or_else(|| LarderError::not_found(format!("Category {id} not found")))
    }

    /// Create a category at the end of the current order.
    pub fn create_category(&self, name: &str) -> Result<Category> {
        let name = validate_name("Category", name)?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let sort_order: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM categories",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO categories (name, sort_order) VALUES (?1, ?2)",
            params![name, sort_order],
        )
        .map_err(|e| {
            map_unique_violation(e, || format!("A category named '{name}' already exists"))
        })?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Category {
            id,
            name: name.to_string(),
            sort_order,
        })
    }

    /// Assign `sort_order = position` to each listed category. Unknown ids are ignored.
    pub fn reorder_categories(&self, ordered_ids: &[i64]) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare("UPDATE categories SET sort_order = ?1 WHERE id = ?2")?;
            for (position, id) in ordered_ids.iter().enumerate() {
                stmt.execute(params![position as i64, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_category(&self, id: i64) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let in_use: i64 = tx.query_row(
            "SELECT COUNT(*) FROM ingredients WHERE category_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if in_use > 0 {
            return Err(LarderError::conflict(format!(
                "Category {id} is still used by {in_use} ingredient(s) and cannot be deleted"
            )));
        }
        let rows = tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(LarderError::not_found(format!("Category {id} not found")));
        }
        tx.commit()?;
        Ok(())
    }

    fn ensure_category_exists(conn: &Connection, category_id: Option<i64>) -> Result<()> {
        if let Some(id) = category_id {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(LarderError::validation(format!("Category {id} not found")));
            }
        }
        Ok(())
    }

    // --- Ingredients ---

    pub fn list_ingredients(&self) -> Result<Vec<Ingredient>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{INGREDIENT_SELECT} ORDER BY {CATEGORY_ORDER}"))?;
        let ingredients = stmt
            .query_map([], Self::ingredient_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ingredients)
    }

    pub fn get_ingredient(&self, id: i64) -> Result<Ingredient> {
        self.conn
            .query_row(
                &format!("{INGREDIENT_SELECT} WHERE i.id = ?1"),
                params![id],
                Self::ingredient_from_row,
            )
            .optional()?
            .ok_or_else(|| LarderError::not_found(format!("Ingredient {id} not found")))
    }

    pub fn create_ingredient(&self, ingredient: &NewIngredient) -> Result<Ingredient> {
        let name = validate_name("Ingredient", &ingredient.name)?;
        let unit = normalize_unit(ingredient.unit.as_deref());
        Self::ensure_category_exists(&self.conn, ingredient.category_id)?;
        self.conn
            .execute(
                "INSERT INTO ingredients (name, unit, category_id) VALUES (?1, ?2, ?3)",
                params![name, unit, ingredient.category_id],
            )
            .map_err(|e| {
                map_unique_violation(e, || format!("An ingredient named '{name}' already exists"))
            })?;
        let id = self.conn.last_insert_rowid();
        self.get_ingredient(id)
    }

    pub fn update_ingredient(&self, id: i64, ingredient: &NewIngredient) -> Result<Ingredient> {
        let name = validate_name("Ingredient", &ingredient.name)?;
        let unit = normalize_unit(ingredient.unit.as_deref());
        Self::ensure_category_exists(&self.conn, ingredient.category_id)?;
        let rows = self
            .conn
            .execute(
                "UPDATE ingredients SET name = ?1, unit = ?2, category_id = ?3 WHERE id = ?4",
                params![name, unit, ingredient.category_id, id],
            )
            .map_err(|e| {
                map_unique_violation(e, || {
                    format!("Another ingredient named '{name}' already exists")
                })
            })?;
        if rows == 0 {
            return Err(LarderError::not_found(format!("Ingredient {id} not found")));
        }
        self.get_ingredient(id)
    }

    /// Delete an ingredient that no recipe uses. Its shopping list row goes with it.
    pub fn delete_ingredient(&self, id: i64) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let in_use: i64 = tx.query_row(
            "SELECT COUNT(*) FROM recipe_ingredients WHERE ingredient_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if in_use > 0 {
            return Err(LarderError::conflict(format!(
                "Ingredient {id} is still used in {in_use} recipe(s) and cannot be deleted"
            )));
        }
        let rows = tx.execute("DELETE FROM ingredients WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(LarderError::not_found(format!("Ingredient {id} not found")));
        }
        tx.commit()?;
        Ok(())
    }

    /// Look an ingredient up by name (case-insensitive), creating it if missing.
    pub fn find_or_create_ingredient(&self, name: &str, unit: Option<&str>) -> Result<Ingredient> {
        let name = validate_name("Ingredient", name)?;
        let id = Self::resolve_ingredient(&self.conn, name, normalize_unit(unit).as_deref())?;
        self.get_ingredient(id)
    }

    // An existing ingredient keeps its unit.
    fn resolve_ingredient(conn: &Connection, name: &str, unit: Option<&str>) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM ingredients WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO ingredients (name, unit) VALUES (?1, ?2)",
            params![name, unit],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // --- Recipes ---

    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.name, r.instructions, r.image_url, COUNT(ri.ingredient_id),
                    r.created_at, r.updated_at
             FROM recipes r
             LEFT JOIN recipe_ingredients ri ON ri.recipe_id = r.id
             GROUP BY r.id
             ORDER BY r.name COLLATE NOCASE, r.id",
        )?;
        let recipes = stmt
            .query_map([], Self::recipe_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(recipes)
    }

    pub fn get_recipe_detail(&self, id: i64) -> Result<RecipeDetail> {
        let recipe = self
            .conn
            .query_row(
                "SELECT id, name, instructions, image_url, 0, created_at, updated_at
                 FROM recipes WHERE id = ?1",
                params![id],
                Self::recipe_from_row,
            )
            .optional()?
            .ok_or_else(|| LarderError::not_found(format!("Recipe {id} not found")))?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT i.id, i.name, i.unit, c.name, ri.amount_hundredths
             FROM recipe_ingredients ri
             JOIN ingredients i ON ri.ingredient_id = i.id
             LEFT JOIN categories c ON i.category_id = c.id
             WHERE ri.recipe_id = ?1
             ORDER BY {CATEGORY_ORDER}"
        ))?;
        let ingredients = stmt
            .query_map(params![id], |row| {
                Ok(RecipeIngredient {
                    ingredient_id: row.get(0)?,
                    name: row.get(1)?,
                    unit: row.get(2)?,
                    category: row.get(3)?,
                    amount: amount_from_hundredths(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RecipeDetail {
            id: recipe.id,
            name: recipe.name,
            instructions: recipe.instructions,
            image_url: recipe.image_url,
            created_at: recipe.created_at,
            updated_at: recipe.updated_at,
            ingredients,
        })
    }

    /// Create a recipe and its ingredient lines in one transaction.
    pub fn create_recipe(&self, recipe: &NewRecipe) -> Result<RecipeDetail> {
        let name = validate_name("Recipe", &recipe.name)?;
        let lines = validate_recipe_lines(recipe)?;
        let now = Local::now().to_rfc3339();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO recipes (name, instructions, image_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, recipe.instructions, recipe.image_url, now],
        )?;
        let id = tx.last_insert_rowid();
        Self::insert_recipe_lines(&tx, id, &lines)?;
        tx.commit()?;

        self.get_recipe_detail(id)
    }

    /// Replace a recipe's fields and its full set of ingredient lines.
    pub fn update_recipe(&self, id: i64, recipe: &NewRecipe) -> Result<RecipeDetail> {
        let name = validate_name("Recipe", &recipe.name)?;
        let lines = validate_recipe_lines(recipe)?;
        let now = Local::now().to_rfc3339();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let rows = tx.execute(
            "UPDATE recipes SET name = ?1, instructions = ?2, image_url = ?3, updated_at = ?4
             WHERE id = ?5",
            params![name, recipe.instructions, recipe.image_url, now, id],
        )?;
        if rows == 0 {
            return Err(LarderError::not_found(format!("Recipe {id} not found")));
        }
        tx.execute(
            "DELETE FROM recipe_ingredients WHERE recipe_id = ?1",
            params![id],
        )?;
        Self::insert_recipe_lines(&tx, id, &lines)?;
        tx.commit()?;

        self.get_recipe_detail(id)
    }

    /// Store a recipe whose lines name their ingredients. Missing ingredients
    /// are created and lines naming the same ingredient are summed. Nothing is
    /// written unless the whole recipe is.
    pub fn import_recipe(
        &self,
        name: &str,
        instructions: Option<&str>,
        lines: &[ImportedLine],
    ) -> Result<RecipeDetail> {
        let name = validate_name("Recipe", name)?;
        let lines = group_imported_lines(lines)?;
        let now = Local::now().to_rfc3339();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO recipes (name, instructions, image_url, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![name, instructions, now],
        )?;
        let id = tx.last_insert_rowid();
        let mut resolved = Vec::with_capacity(lines.len());
        for (ingredient_name, unit, hundredths) in &lines {
            let ingredient_id = Self::resolve_ingredient(&tx, ingredient_name, unit.as_deref())?;
            resolved.push((ingredient_id, *hundredths));
        }
        Self::insert_recipe_lines(&tx, id, &resolved)?;
        tx.commit()?;

        debug!(recipe = id, lines = resolved.len(), "imported recipe");
        self.get_recipe_detail(id)
    }

    pub fn delete_recipe(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn insert_recipe_lines(conn: &Connection, recipe_id: i64, lines: &[(i64, i64)]) -> Result<()> {
        let mut exists = conn.prepare("SELECT EXISTS(SELECT 1 FROM ingredients WHERE id = ?1)")?;
        let mut insert = conn.prepare(
            "INSERT INTO recipe_ingredients (recipe_id, ingredient_id, amount_hundredths)
             VALUES (?1, ?2, ?3)",
        )?;
        for &(ingredient_id, hundredths) in lines {
            let found: bool = exists.query_row(params![ingredient_id], |row| row.get(0))?;
            if !found {
                return Err(LarderError::validation(format!(
                    "Ingredient {ingredient_id} not found"
                )));
            }
            insert.execute(params![recipe_id, ingredient_id, hundredths])?;
        }
        Ok(())
    }

    // --- Recipe store: batched read for the aggregator ---

    /// All ingredient lines of the given recipes, in one query.
    pub fn ingredient_lines(&self, recipe_ids: &[i64]) -> Result<Vec<IngredientLine>> {
        Self::ingredient_lines_in(&self.conn, recipe_ids)
    }

    fn ingredient_lines_in(conn: &Connection, recipe_ids: &[i64]) -> Result<Vec<IngredientLine>> {
        if recipe_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; recipe_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT recipe_id, ingredient_id, amount_hundredths
             FROM recipe_ingredients
             WHERE recipe_id IN ({placeholders})
             ORDER BY recipe_id, ingredient_id"
        ))?;
        let lines = stmt
            .query_map(params_from_iter(recipe_ids), |row| {
                Ok(IngredientLine {
                    recipe_id: row.get(0)?,
                    ingredient_id: row.get(1)?,
                    amount: amount_from_hundredths(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    // --- Shopping list ---

    pub fn list_shopping_list(&self) -> Result<Vec<ShoppingListItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SHOPPING_LIST_SELECT} ORDER BY {CATEGORY_ORDER}"))?;
        let items = stmt
            .query_map([], Self::shopping_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn get_shopping_list_item(&self, id: i64) -> Result<ShoppingListItem> {
        self.conn
            .query_row(
                &format!("{SHOPPING_LIST_SELECT} WHERE sli.id = ?1"),
                params![id],
                Self::shopping_item_from_row,
            )
            .optional()?
            .ok_or_else(|| LarderError::not_found(format!("Shopping list item {id} not found")))
    }

    pub fn get_shopping_list_item_by_ingredient(
        &self,
        ingredient_id: i64,
    ) -> Result<Option<ShoppingListItem>> {
        let item = self
            .conn
            .query_row(
                &format!("{SHOPPING_LIST_SELECT} WHERE sli.ingredient_id = ?1"),
                params![ingredient_id],
                Self::shopping_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Insert a row for the ingredient, or accumulate into the open one and
    /// mark it unchecked. The unit override only applies to a fresh row.
    fn upsert_accumulate(
        conn: &Connection,
        ingredient_id: i64,
        hundredths: i64,
        unit: Option<&str>,
        now: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO shopping_list_items (ingredient_id, amount_hundredths, is_checked, unit, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4)
             ON CONFLICT(ingredient_id) DO UPDATE SET
                amount_hundredths = amount_hundredths + excluded.amount_hundredths,
                is_checked = 0,
                updated_at = excluded.updated_at",
            params![ingredient_id, hundredths, unit, now],
        )?;
        Ok(())
    }

    /// Manually put an ingredient on the list.
    pub fn add_shopping_list_item(
        &self,
        ingredient_id: i64,
        amount: Decimal,
        unit: Option<&str>,
    ) -> Result<AddedItem> {
        let hundredths = validate_positive_amount(amount)?;
        let unit = normalize_unit(unit);
        let now = Local::now().to_rfc3339();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let ingredient_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM ingredients WHERE id = ?1)",
            params![ingredient_id],
            |row| row.get(0),
        )?;
        if !ingredient_exists {
            return Err(LarderError::validation(format!(
                "Ingredient {ingredient_id} not found"
            )));
        }
        let already_listed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM shopping_list_items WHERE ingredient_id = ?1)",
            params![ingredient_id],
            |row| row.get(0),
        )?;
        Self::upsert_accumulate(&tx, ingredient_id, hundredths, unit.as_deref(), &now)
            .map_err(|e| map_range_violation(e, ingredient_id))?;
        tx.commit()?;

        let item = self
            .get_shopping_list_item_by_ingredient(ingredient_id)?
            .context("shopping list row vanished after upsert")?;
        let outcome = if already_listed {
            AddOutcome::Merged
        } else {
            AddOutcome::Created
        };
        Ok(AddedItem { outcome, item })
    }

    pub fn update_shopping_list_item(
        &self,
        id: i64,
        update: &UpdateShoppingListItem,
    ) -> Result<ShoppingListItem> {
        if update.amount.is_none() && update.is_checked.is_none() {
            return Err(LarderError::validation(
                "Either amount or is_checked must be provided",
            ));
        }
        let hundredths = update
            .amount
            .map(validate_non_negative_amount)
            .transpose()?;
        let now = Local::now().to_rfc3339();

        let rows = self.conn.execute(
            "UPDATE shopping_list_items SET
                amount_hundredths = COALESCE(?1, amount_hundredths),
                is_checked = COALESCE(?2, is_checked),
                updated_at = ?3
             WHERE id = ?4",
            params![hundredths, update.is_checked, now, id],
        )?;
        if rows == 0 {
            return Err(LarderError::not_found(format!(
                "Shopping list item {id} not found"
            )));
        }
        self.get_shopping_list_item(id)
    }

    pub fn delete_shopping_list_item(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM shopping_list_items WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Purge every checked row. Returns how many were removed.
    pub fn clear_checked_items(&self) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM shopping_list_items WHERE is_checked = 1", [])?;
        Ok(rows)
    }

    /// Merge the ingredient needs of a recipe selection into the shopping list.
    ///
    /// `counts` maps each distinct recipe id to how often it was selected.
    /// The batched read, the aggregation, and every upsert run inside one
    /// `BEGIN IMMEDIATE` transaction: concurrent generations serialize on the
    /// database write lock, and accumulation happens in SQL, so no merge is
    /// lost. Any failure drops the transaction uncommitted.
    pub fn generate_shopping_list(&self, counts: &BTreeMap<i64, u32>) -> Result<GenerationSummary> {
        let recipe_ids: Vec<i64> = counts.keys().copied().collect();
        let now = Local::now().to_rfc3339();

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to begin shopping list transaction")?;

        let lines = Self::ingredient_lines_in(&tx, &recipe_ids)?;
        let totals = aggregate_lines(&lines, counts)?;

        for (&ingredient_id, &amount) in &totals {
            let hundredths = amount_to_hundredths(amount)
                .map_err(|_| list_amount_overflow(ingredient_id))?;
            Self::upsert_accumulate(&tx, ingredient_id, hundredths, None, &now)
                .map_err(|e| map_range_violation(e, ingredient_id))
                .with_context(|| format!("failed to merge ingredient {ingredient_id}"))?;
        }

        tx.commit().context("failed to commit shopping list")?;

        debug!(
            recipes = counts.len(),
            lines = lines.len(),
            ingredients = totals.len(),
            "merged recipe selection into shopping list"
        );

        Ok(GenerationSummary {
            recipes: counts.len(),
            ingredients: totals.len(),
        })
    }
}

/// Check recipe lines before any write: positive amounts, each ingredient once.
/// Returns `(ingredient_id, hundredths)` pairs.
fn validate_recipe_lines(recipe: &NewRecipe) -> Result<Vec<(i64, i64)>> {
    let mut seen = HashSet::new();
    let mut lines = Vec::with_capacity(recipe.ingredients.len());
    for line in &recipe.ingredients {
        if !seen.insert(line.ingredient_id) {
            return Err(LarderError::validation(format!(
                "Ingredient {} is listed more than once",
                line.ingredient_id
            )));
        }
        let hundredths = validate_positive_amount(line.amount).map_err(|e| {
            LarderError::validation(format!("Ingredient {}: {e}", line.ingredient_id))
        })?;
        lines.push((line.ingredient_id, hundredths));
    }
    Ok(lines)
}

/// Validate imported lines and merge those naming the same ingredient, using
/// the same case folding as the `NOCASE` name column. Returns
/// `(name, unit, hundredths)` in first-seen order.
fn group_imported_lines(lines: &[ImportedLine]) -> Result<Vec<(String, Option<String>, i64)>> {
    if lines.is_empty() {
        return Err(LarderError::validation("An imported recipe needs at least one ingredient"));
    }
    let mut grouped: Vec<(String, Option<String>, i64)> = Vec::with_capacity(lines.len());
    for line in lines {
        let name = validate_name("Ingredient", &line.name)?;
        let hundredths = validate_positive_amount(line.amount)
            .map_err(|e| LarderError::validation(format!("Ingredient '{name}': {e}")))?;
        if let Some(entry) = grouped.iter_mut().find(|(n, _, _)| n.eq_ignore_ascii_case(name)) {
            entry.2 = entry
                .2
                .checked_add(hundredths)
                .filter(|total| *total <= MAX_AMOUNT_HUNDREDTHS)
                .ok_or_else(|| {
                    LarderError::validation(format!("Total amount of '{name}' is out of range"))
                })?;
        } else {
            grouped.push((name.to_string(), normalize_unit(line.unit.as_deref()), hundredths));
        }
    }
    Ok(grouped)
}

fn map_unique_violation(err: rusqlite::Error, message: impl FnOnce() -> String) -> anyhow::Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            LarderError::conflict(message())
        }
        _ => err.into(),
    }
}

/// A failed `CHECK` on a list row means the accumulated amount left the
/// storable range.
fn map_range_violation(err: rusqlite::Error, ingredient_id: i64) -> anyhow::Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_CHECK =>
        {
            list_amount_overflow(ingredient_id)
        }
        _ => err.into(),
    }
}

#[cfg(test)]
impl Database {
    pub(crate) fn execute_batch_for_test(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}
