// src/gateway.rs
//
// What request handlers call: finance operations that delegate conversion and
// rendering to the workers and merge the answers with the local records.

use std::time::Duration;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::{AggregationReply, AggregationRequest, ReportRequest};
use crate::models::{Currency, IncomeRecord, PurchaseRecord};
use crate::rabbitmq::{Result, RpcClient, RpcError, Topic};

/// Placeholder for every remote field when the aggregator did not answer.
pub const NO_RESPONSE: &str = "doesn't respond";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do when the aggregator misses its deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Surface `RpcError::Timeout` to the caller.
    #[default]
    Fail,
    /// Answer with the local records and `NO_RESPONSE` in place of totals.
    Degrade,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Totals {
    Converted(AggregationReply),
    Unavailable,
}

impl Totals {
    pub fn is_available(&self) -> bool {
        matches!(self, Totals::Converted(_))
    }
}

impl Serialize for Totals {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(4))?;
        match self {
            Totals::Converted(reply) => {
                map.serialize_entry("euro", &reply.euro)?;
                map.serialize_entry("rub", &reply.rub)?;
                map.serialize_entry("rsd", &reply.rsd)?;
                map.serialize_entry("answer", &reply.answer)?;
            }
            Totals::Unavailable => {
                for key in ["euro", "rub", "rsd", "answer"] {
                    map.serialize_entry(key, NO_RESPONSE)?;
                }
            }
        }
        map.end()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IncomeSummary {
    pub incomes: Vec<IncomeRecord>,
    #[serde(flatten)]
    pub totals: Totals,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PurchaseSummary {
    pub purchases: Vec<PurchaseRecord>,
    #[serde(flatten)]
    pub totals: Totals,
}

pub struct FinanceGateway {
    client: RpcClient,
    aggregation: Topic,
    reports: Topic,
    aggregation_timeout: Duration,
    report_timeout: Duration,
}

impl FinanceGateway {
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            aggregation: Topic::currency_aggregator(),
            reports: Topic::report_builder(),
            aggregation_timeout: DEFAULT_TIMEOUT,
            report_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_topics(mut self, aggregation: Topic, reports: Topic) -> Self {
        self.aggregation = aggregation;
        self.reports = reports;
        self
    }

    pub fn with_timeouts(mut self, aggregation: Duration, report: Duration) -> Self {
        self.aggregation_timeout = aggregation;
        self.report_timeout = report;
        self
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub async fn income_summary(
        &self,
        incomes: Vec<IncomeRecord>,
        currency: Currency,
        policy: TimeoutPolicy,
    ) -> Result<IncomeSummary> {
        let request = AggregationRequest::Incomes {
            incomes: incomes.clone(),
            current_currency: currency,
        };
        let totals = self.aggregate(&request, policy).await?;
        Ok(IncomeSummary { incomes, totals })
    }

    pub async fn purchase_summary(
        &self,
        purchases: Vec<PurchaseRecord>,
        currency: Currency,
        policy: TimeoutPolicy,
    ) -> Result<PurchaseSummary> {
        let request = AggregationRequest::Purchases {
            purchases: purchases.clone(),
            current_currency: currency,
        };
        let totals = self.aggregate(&request, policy).await?;
        Ok(PurchaseSummary { purchases, totals })
    }

    async fn aggregate(&self, request: &AggregationRequest, policy: TimeoutPolicy) -> Result<Totals> {
        debug!(
            topic = %self.aggregation.name,
            records = request.len(),
            currency = %request.current_currency(),
            "Requesting currency aggregation"
        );

        match self
            .client
            .call_json::<_, AggregationReply>(&self.aggregation, request, self.aggregation_timeout)
            .await
        {
            Ok(reply) => Ok(Totals::Converted(reply)),
            Err(e) if e.is_timeout() && policy == TimeoutPolicy::Degrade => {
                warn!(topic = %self.aggregation.name, error = %e, "Aggregator did not respond, degrading");
                Ok(Totals::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the report worker for a PDF. There is no degraded report.
    pub async fn build_report(&self, request: &ReportRequest) -> Result<Vec<u8>> {
        debug!(
            topic = %self.reports.name,
            purchases = request.purchases.len(),
            incomes = request.incomes.len(),
            start = %request.start_date,
            end = %request.end_date,
            "Requesting report"
        );

        let payload = serde_json::to_vec(request)
            .map_err(|e| RpcError::SerializationError(e.to_string()))?;
        self.client
            .call(&self.reports, payload, self.report_timeout)
            .await
    }
}
