//! Reusable validators for [`PhaseDef::validate`](crate::phase::PhaseDef::validate).

use chrono::NaiveDate;
use serde_json::{Value, json};

use crate::fields::Fields;

/// Canonical date format for every date field (`дд.мм.гггг`)
pub const DATE_FORMAT: &str = "%d.%m.%Y";

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Single date; normalised so `1.3.2026` is stored as `01.03.2026`
pub fn date(value: Value, _: &Fields) -> Result<Value, String> {
    value
        .as_str()
        .and_then(parse_date)
        .map(|d| Value::String(format_date(d)))
        .ok_or_else(|| "Некорректный формат даты. Введите в формате дд.мм.гггг:".to_string())
}

/// `дд.мм.гггг` (end date only) or `дд.мм.гггг - дд.мм.гггг`.
///
/// Produces `{"start_date": .., "end_date": ..}` with a null start for the single form.
pub fn date_range(value: Value, _: &Fields) -> Result<Value, String> {
    const FORMAT_HINT: &str =
        "Некорректный формат дат. Введите 'ДД.ММ.ГГГГ' или 'ДД.ММ.ГГГГ - ДД.ММ.ГГГГ'.";
    let text = value.as_str().unwrap_or_default();
    let parts: Vec<&str> = text.split(" - ").collect();
    match parts.as_slice() {
        [end] => {
            let end = parse_date(end).ok_or(FORMAT_HINT)?;
            Ok(json!({ "start_date": null, "end_date": format_date(end) }))
        }
        [start, end] => {
            let start = parse_date(start).ok_or(FORMAT_HINT)?;
            let end = parse_date(end).ok_or(FORMAT_HINT)?;
            if start > end {
                return Err("Дата начала не может быть позже даты окончания. Попробуйте снова.".to_string());
            }
            Ok(json!({ "start_date": format_date(start), "end_date": format_date(end) }))
        }
        _ => Err(FORMAT_HINT.to_string()),
    }
}

/// Free text where "нет" means "nothing to record"
pub fn optional_text(value: Value, _: &Fields) -> Result<Value, String> {
    match value.as_str() {
        Some(text) if text.trim().to_lowercase() == "нет" => Ok(Value::Null),
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_is_normalised() {
        let fields = Fields::new();
        assert_eq!(date(json!("1.3.2026"), &fields), Ok(json!("01.03.2026")));
        assert!(date(json!("2026-03-01"), &fields).is_err());
        assert!(date(json!("31.02.2026"), &fields).is_err());
    }

    #[test]
    fn test_date_range_forms() {
        let fields = Fields::new();
        assert_eq!(
            date_range(json!("01.03.2026 - 15.03.2026"), &fields),
            Ok(json!({"start_date": "01.03.2026", "end_date": "15.03.2026"}))
        );
        assert_eq!(
            date_range(json!("15.03.2026"), &fields),
            Ok(json!({"start_date": null, "end_date": "15.03.2026"}))
        );
        let err = date_range(json!("15.03.2026 - 01.03.2026"), &fields).unwrap_err();
        assert!(err.contains("не может быть позже"));
        assert!(date_range(json!("01.03 - 02.03 - 03.03"), &fields).is_err());
    }

    #[test]
    fn test_no_becomes_null() {
        let fields = Fields::new();
        assert_eq!(optional_text(json!("Нет"), &fields), Ok(Value::Null));
        assert_eq!(
            optional_text(json!("https://vk.com/post"), &fields),
            Ok(json!("https://vk.com/post"))
        );
    }
}
