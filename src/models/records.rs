// src/models/records.rs
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Eur,
    Rub,
    Rsd,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported currency '{0}', expected one of EUR, RUB, RSD")]
pub struct UnknownCurrency(pub String);

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Eur, Currency::Rub, Currency::Rsd];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Rub => "RUB",
            Currency::Rsd => "RSD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = UnknownCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::ALL
            .into_iter()
            .find(|currency| currency.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCurrency(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub id: i64,
    pub owner_id: i64,
    pub description: String,
    pub quantity: f64,
    #[serde(default)]
    pub currency: Currency,
    pub created_at: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub currency: Currency,
    pub owner_id: Option<i64>,
    pub category_id: i64,
    pub created_at: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: i64,
    /// `None` for the shared root categories.
    pub owner_id: Option<i64>,
    pub category_name: String,
    #[serde(default)]
    pub is_root: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parse() {
        assert_eq!("EUR".parse::<Currency>(), Ok(Currency::Eur));
        assert_eq!("rsd".parse::<Currency>(), Ok(Currency::Rsd));
        assert_eq!(
            "INVALID".parse::<Currency>(),
            Err(UnknownCurrency("INVALID".to_string()))
        );
    }

    #[test]
    fn test_purchase_from_json() {
        let purchase: PurchaseRecord = serde_json::from_str(
            r#"{
                "id": 1,
                "name": "Moza R5",
                "description": "Steering Wheel",
                "price": 700,
                "currency": "EUR",
                "owner_id": 123,
                "category_id": 9,
                "created_at": "2025-08-21"
            }"#,
        )
        .unwrap();

        assert_eq!(purchase.currency, Currency::Eur);
        assert_eq!(purchase.price, 700.0);
        assert_eq!(
            purchase.created_at,
            NaiveDate::from_ymd_opt(2025, 8, 21).unwrap()
        );
    }

    #[test]
    fn test_income_serializes_iso_date() {
        let income = IncomeRecord {
            id: 7,
            owner_id: 123,
            description: "Salary".to_string(),
            quantity: 1200.0,
            currency: Currency::Rsd,
            created_at: NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
        };

        let value = serde_json::to_value(&income).unwrap();
        assert_eq!(value["currency"], "RSD");
        assert_eq!(value["created_at"], "2025-10-01");
    }
}
