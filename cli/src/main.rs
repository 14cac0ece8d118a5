mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{
    cmd_category_add, cmd_category_delete, cmd_category_list, cmd_category_reorder,
    cmd_ingredient_add, cmd_ingredient_delete, cmd_ingredient_list, cmd_ingredient_update,
    cmd_list_add, cmd_list_clear_checked, cmd_list_generate, cmd_list_remove, cmd_list_show,
    cmd_list_update, cmd_recipe_create, cmd_recipe_delete, cmd_recipe_import, cmd_recipe_list,
    cmd_recipe_show, parse_amount,
};
use crate::config::Config;
use larder_core::db::Database;
use larder_core::models::UpdateShoppingListItem;

#[derive(Parser)]
#[command(
    name = "larder",
    version,
    about = "Recipes, ingredients and a shared shopping list"
)]
struct Cli {
    /// Database file (default: larder.db in the data directory)
    #[arg(long, global = true, env = "LARDER_DB", value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
    /// Manage shop categories (aisles)
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Manage the ingredient catalogue
    Ingredient {
        #[command(subcommand)]
        command: IngredientCommands,
    },
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Work with the shopping list
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    /// List categories in shop order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a category at the end of the order
    Add {
        /// Category name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the shop order: categories in the order given
    Reorder {
        /// Category IDs, first to last
        #[arg(required = true)]
        ids: Vec<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an unused category
    Delete {
        /// Category ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum IngredientCommands {
    /// List all ingredients
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an ingredient
    Add {
        /// Ingredient name
        name: String,
        /// Default unit (e.g. g, ml, pcs)
        #[arg(short, long)]
        unit: Option<String>,
        /// Category ID
        #[arg(short, long)]
        category: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rename an ingredient or change its unit/category
    Update {
        /// Ingredient ID
        id: i64,
        /// New name
        name: String,
        /// Default unit
        #[arg(short, long)]
        unit: Option<String>,
        /// Category ID
        #[arg(short, long)]
        category: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an ingredient no recipe uses
    Delete {
        /// Ingredient ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// List all recipes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a recipe with its ingredients
    Show {
        /// Recipe ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a recipe
    Create {
        /// Recipe name
        name: String,
        /// Preparation instructions
        #[arg(long)]
        instructions: Option<String>,
        /// Ingredient line as INGREDIENT_ID=AMOUNT (repeatable)
        #[arg(short, long = "ingredient", value_name = "ID=AMOUNT")]
        ingredients: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe
    Delete {
        /// Recipe ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a recipe from a Cooklang (.cook) file
    Import {
        /// Path to the .cook file
        file: PathBuf,
        /// Recipe name override (defaults to metadata title or filename)
        #[arg(long)]
        name: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    /// Show the shopping list grouped by category order
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an ingredient (merges into an existing row)
    Add {
        /// Ingredient ID
        ingredient_id: i64,
        /// Amount to add (e.g. 250, 0.5)
        amount: String,
        /// Unit for a new row (defaults to the ingredient's unit)
        #[arg(short, long)]
        unit: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark an item as bought
    Check {
        /// Item ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark an item as still to buy
    Uncheck {
        /// Item ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Overwrite an item's amount
    Set {
        /// Item ID
        id: i64,
        /// New amount (0 or more)
        amount: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an item
    Remove {
        /// Item ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every checked item
    ClearChecked {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge the ingredients of recipes into the list (repeat an ID to double it)
    Generate {
        /// Recipe IDs
        #[arg(required = true)]
        recipe_ids: Vec<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if matches!(cli.command, Commands::Serve { .. }) {
        "larder=info,larder_core=info,tower_http=info"
    } else {
        "warn"
    };
    init_tracing(default_filter);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.db)?;
    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                let (key, created) = config.load_or_create_api_key()?;
                if created {
                    eprintln!("Generated new API key: {key}");
                    eprintln!("Include in requests: Authorization: Bearer {key}");
                }
                Some(key)
            };
            server::start_server(db, port, &bind, api_key).await
        }
        Commands::Category { command } => match command {
            CategoryCommands::List { json } => cmd_category_list(&db, json),
            CategoryCommands::Add { name, json } => cmd_category_add(&db, &name, json),
            CategoryCommands::Reorder { ids, json } => cmd_category_reorder(&db, &ids, json),
            CategoryCommands::Delete { id, json } => cmd_category_delete(&db, id, json),
        },
        Commands::Ingredient { command } => match command {
            IngredientCommands::List { json } => cmd_ingredient_list(&db, json),
            IngredientCommands::Add {
                name,
                unit,
                category,
                json,
            } => cmd_ingredient_add(&db, &name, unit, category, json),
            IngredientCommands::Update {
                id,
                name,
                unit,
                category,
                json,
            } => cmd_ingredient_update(&db, id, &name, unit, category, json),
            IngredientCommands::Delete { id, json } => cmd_ingredient_delete(&db, id, json),
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::List { json } => cmd_recipe_list(&db, json),
            RecipeCommands::Show { id, json } => cmd_recipe_show(&db, id, json),
            RecipeCommands::Create {
                name,
                instructions,
                ingredients,
                json,
            } => cmd_recipe_create(&db, &name, instructions, &ingredients, json),
            RecipeCommands::Delete { id, json } => cmd_recipe_delete(&db, id, json),
            RecipeCommands::Import { file, name, json } => {
                cmd_recipe_import(&db, &file, name, json)
            }
        },
        Commands::List { command } => match command {
            ListCommands::Show { json } => cmd_list_show(&db, json),
            ListCommands::Add {
                ingredient_id,
                amount,
                unit,
                json,
            } => {
                let amount = parse_amount(&amount)?;
                cmd_list_add(&db, ingredient_id, amount, unit.as_deref(), json)
            }
            ListCommands::Check { id, json } => {
                cmd_list_update(&db, id, &checked(true), json)
            }
            ListCommands::Uncheck { id, json } => {
                cmd_list_update(&db, id, &checked(false), json)
            }
            ListCommands::Set { id, amount, json } => {
                let update = UpdateShoppingListItem {
                    amount: Some(parse_amount(&amount)?),
                    is_checked: None,
                };
                cmd_list_update(&db, id, &update, json)
            }
            ListCommands::Remove { id, json } => cmd_list_remove(&db, id, json),
            ListCommands::ClearChecked { json } => cmd_list_clear_checked(&db, json),
            ListCommands::Generate { recipe_ids, json } => {
                cmd_list_generate(&db, &recipe_ids, json)
            }
        },
    }
}

fn checked(is_checked: bool) -> UpdateShoppingListItem {
    UpdateShoppingListItem {
        amount: None,
        is_checked: Some(is_checked),
    }
}
