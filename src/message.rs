// src/message.rs
// Bodies exchanged with the aggregation and report workers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{CategoryRecord, Currency, IncomeRecord, PurchaseRecord};

/// Request to the currency aggregator, tagged by the `content` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content")]
pub enum AggregationRequest {
    Incomes {
        incomes: Vec<IncomeRecord>,
        current_currency: Currency,
    },
    Purchases {
        purchases: Vec<PurchaseRecord>,
        current_currency: Currency,
    },
}

impl AggregationRequest {
    pub fn current_currency(&self) -> Currency {
        match self {
            AggregationRequest::Incomes {
                current_currency, ..
            }
            | AggregationRequest::Purchases {
                current_currency, ..
            } => *current_currency,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AggregationRequest::Incomes { incomes, .. } => incomes.len(),
            AggregationRequest::Purchases { purchases, .. } => purchases.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Totals converted into each supported currency, plus the total in the
/// requested one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReply {
    pub euro: f64,
    pub rub: f64,
    pub rsd: f64,
    pub answer: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub purchases: Vec<PurchaseRecord>,
    pub incomes: Vec<IncomeRecord>,
    pub categories: Vec<CategoryRecord>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub current_currency: Currency,
}
