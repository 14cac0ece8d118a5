mod category;
mod helpers;
mod ingredient;
mod list;
mod recipe;

pub(crate) use category::{
    cmd_category_add, cmd_category_delete, cmd_category_list, cmd_category_reorder,
};
pub(crate) use helpers::parse_amount;
pub(crate) use ingredient::{
    cmd_ingredient_add, cmd_ingredient_delete, cmd_ingredient_list, cmd_ingredient_update,
};
pub(crate) use list::{
    cmd_list_add, cmd_list_clear_checked, cmd_list_generate, cmd_list_remove, cmd_list_show,
    cmd_list_update,
};
pub(crate) use recipe::{
    cmd_recipe_create, cmd_recipe_delete, cmd_recipe_import, cmd_recipe_list, cmd_recipe_show,
};
