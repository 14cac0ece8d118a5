use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use serde::Serialize;
use std::process;
use std::str::FromStr;

use larder_core::models::NewRecipeLine;

/// Parse an amount like "250", "0.5" or "1.25".
pub(crate) fn parse_amount(s: &str) -> Result<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .with_context(|| format!("Invalid amount: '{s}'. Use a number like '250' or '0.5'"))
}

/// Parse an `ID=AMOUNT` recipe line, e.g. "3=250" or "12=0.5".
pub(crate) fn parse_recipe_line(s: &str) -> Result<NewRecipeLine> {
    let Some((id, amount)) = s.split_once('=') else {
        bail!("Invalid ingredient line '{s}'. Use INGREDIENT_ID=AMOUNT (e.g. 3=250)");
    };
    let ingredient_id: i64 = id
        .trim()
        .parse()
        .with_context(|| format!("Invalid ingredient id in '{s}'"))?;
    let amount = parse_amount(amount)?;
    if amount <= Decimal::ZERO {
        bail!("Amount in '{s}' must be greater than 0");
    }
    Ok(NewRecipeLine {
        ingredient_id,
        amount,
    })
}

/// Render an amount with its unit for table output: "250.00 g".
pub(crate) fn format_amount(amount: Decimal, unit: Option<&str>) -> String {
    match unit {
        Some(u) => format!("{amount} {u}"),
        None => amount.to_string(),
    }
}

/// Print a "nothing here" message and exit with status 2.
pub(crate) fn exit_empty(json: bool, message: &str) -> ! {
    if json {
        println!("[]");
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

/// Print a "not found" message and exit with status 2.
pub(crate) fn exit_not_found(json: bool, message: &str) -> ! {
    if json {
        println!("{}", json_error(message));
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("250").unwrap(), Decimal::from(250));
        assert_eq!(parse_amount(" 0.5 ").unwrap(), Decimal::new(5, 1));
        assert!(parse_amount("lots").is_err());
    }

    #[test]
    fn test_parse_recipe_line() {
        let line = parse_recipe_line("3=250").unwrap();
        assert_eq!(line.ingredient_id, 3);
        assert_eq!(line.amount, Decimal::from(250));

        let line = parse_recipe_line(" 12 = 0.25").unwrap();
        assert_eq!(line.ingredient_id, 12);
        assert_eq!(line.amount, Decimal::new(25, 2));
    }

    #[test]
    fn test_parse_recipe_line_invalid() {
        assert!(parse_recipe_line("3").is_err());
        assert!(parse_recipe_line("flour=200").is_err());
        assert!(parse_recipe_line("3=abc").is_err());
        assert!(parse_recipe_line("3=0").is_err());
        assert!(parse_recipe_line("3=-1").is_err());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Decimal::new(25000, 2), Some("g")), "250.00 g");
        assert_eq!(format_amount(Decimal::new(200, 2), None), "2.00");
    }

    #[test]
    fn test_json_error() {
        let out = json_error("Recipe 4 not found");
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"], "Recipe 4 not found");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
        assert_eq!(truncate("Müsli", 10), "Müsli");
    }
}
