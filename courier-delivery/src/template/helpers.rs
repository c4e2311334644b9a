//! Filters and functions available to every template.
//!
//! ```jinja
//! {{ order.placed_at | format_date("%d %b %Y") }}
//! {{ order.total | format_currency("EUR") }}
//! {{ add(order.items, 1) }} {{ choose(user.vip, "Dear friend", "Hello") }}
//! ```

use chrono::{DateTime, Utc};
use minijinja::{Environment, Error, ErrorKind, Value};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn register(env: &mut Environment<'static>) {
    env.add_filter("format_date", format_date);
    env.add_filter("format_currency", format_currency);
    env.add_function("format_date", format_date);
    env.add_function("format_currency", format_currency);
    env.add_function("add", add);
    env.add_function("subtract", subtract);
    env.add_function("multiply", multiply);
    env.add_function("choose", choose);
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

/// Accepts an RFC 3339 string or unix seconds
fn format_date(value: &Value, format: Option<String>) -> Result<String, Error> {
    let timestamp = if let Some(text) = value.as_str() {
        DateTime::parse_from_rfc3339(text)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| invalid(format!("cannot parse date {text:?}: {e}")))?
    } else if let Ok(seconds) = i64::try_from(value.clone()) {
        DateTime::<Utc>::from_timestamp(seconds, 0)
            .ok_or_else(|| invalid(format!("timestamp {seconds} out of range")))?
    } else {
        return Err(invalid(format!("cannot format {value} as a date")));
    };

    let format = format.unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
    let mut out = String::new();
    std::fmt::Write::write_fmt(&mut out, format_args!("{}", timestamp.format(&format)))
        .map_err(|_| invalid(format!("invalid date format {format:?}")))?;

    Ok(out)
}

fn format_currency(amount: f64, code: Option<String>) -> String {
    let code = code.unwrap_or_else(|| "USD".to_string()).to_ascii_uppercase();
    let symbol = match code.as_str() {
        "USD" | "AUD" | "CAD" | "NZD" => Some("$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        "JPY" => Some("¥"),
        _ => None,
    };

    let sign = if amount < 0.0 { "-" } else { "" };
    let digits = if code == "JPY" { 0 } else { 2 };
    let amount = format!("{:.digits$}", amount.abs());

    match symbol {
        Some(symbol) => format!("{sign}{symbol}{amount}"),
        None => format!("{sign}{amount} {code}"),
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Add,
    Subtract,
    Multiply,
}

fn arithmetic(operation: Operation, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    if let (Ok(a), Ok(b)) = (i64::try_from(lhs.clone()), i64::try_from(rhs.clone())) {
        let result = match operation {
            Operation::Add => a.checked_add(b),
            Operation::Subtract => a.checked_sub(b),
            Operation::Multiply => a.checked_mul(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| invalid("integer overflow"));
    }

    let (Ok(a), Ok(b)) = (f64::try_from(lhs.clone()), f64::try_from(rhs.clone())) else {
        return Err(invalid(format!("{lhs} and {rhs} must both be numbers")));
    };

    Ok(Value::from(match operation {
        Operation::Add => a + b,
        Operation::Subtract => a - b,
        Operation::Multiply => a * b,
    }))
}

fn add(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    arithmetic(Operation::Add, lhs, rhs)
}

fn subtract(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    arithmetic(Operation::Subtract, lhs, rhs)
}

fn multiply(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    arithmetic(Operation::Multiply, lhs, rhs)
}

fn choose(condition: &Value, when_true: Value, when_false: Value) -> Value {
    if condition.is_true() {
        when_true
    } else {
        when_false
    }
}
