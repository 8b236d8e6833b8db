// Finance operations end to end: the gateway on one side, stand-in
// aggregator and report workers on the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use finance_rpc::message::{AggregationReply, AggregationRequest, ReportRequest};
use finance_rpc::models::{CategoryRecord, Currency, IncomeRecord, PurchaseRecord};
use finance_rpc::rabbitmq::{
    ChannelConfig, ConnectionManager, InMemoryBroker, RpcClient, RpcError, RpcWorker,
    WorkerHandle,
};
use finance_rpc::{FinanceGateway, TimeoutPolicy, Topic, NO_RESPONSE};
use serde_json::{json, Value};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 8, 21).unwrap()
}

fn incomes() -> Vec<IncomeRecord> {
    vec![
        IncomeRecord {
            id: 1,
            owner_id: 123,
            description: "Salary".to_string(),
            quantity: 100.0,
            currency: Currency::Eur,
            created_at: day(),
        },
        IncomeRecord {
            id: 2,
            owner_id: 123,
            description: "Refund".to_string(),
            quantity: 11700.0,
            currency: Currency::Rsd,
            created_at: day(),
        },
    ]
}

fn purchases() -> Vec<PurchaseRecord> {
    vec![PurchaseRecord {
        id: 7,
        name: "Moza R5".to_string(),
        description: "Steering Wheel".to_string(),
        price: 700.0,
        currency: Currency::Eur,
        owner_id: Some(123),
        category_id: 9,
        created_at: day(),
    }]
}

fn gateway(broker: &InMemoryBroker, timeout: Duration) -> FinanceGateway {
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        ChannelConfig::default(),
    ));
    FinanceGateway::new(RpcClient::new(connections)).with_timeouts(timeout, timeout)
}

fn worker_connections(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::new(Arc::new(broker.clone()), ChannelConfig::default())
}

/// Aggregator that reports fixed totals and remembers what it was asked.
async fn start_aggregator(broker: &InMemoryBroker, seen: Arc<Mutex<Vec<AggregationRequest>>>) -> WorkerHandle {
    let connections = worker_connections(broker);
    RpcWorker::bind(
        &connections,
        "aggregator",
        &Topic::currency_aggregator().request_queue,
    )
    .await
    .unwrap()
    .serve_json(move |request: AggregationRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(request);
            Ok::<_, RpcError>(AggregationReply {
                euro: 200.0,
                rub: 20000.0,
                rsd: 23400.0,
                answer: 20000.0,
            })
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_income_summary_merges_totals() {
    let broker = InMemoryBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = start_aggregator(&broker, seen.clone()).await;
    let gateway = gateway(&broker, Duration::from_secs(2));

    let summary = gateway
        .income_summary(incomes(), Currency::Rub, TimeoutPolicy::Fail)
        .await
        .unwrap();

    assert!(summary.totals.is_available());
    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["answer"], json!(20000.0));
    assert_eq!(value["euro"], json!(200.0));
    assert_eq!(value["incomes"].as_array().unwrap().len(), 2);
    assert_eq!(value["incomes"][1]["currency"], "RSD");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].current_currency(), Currency::Rub);
    assert_eq!(seen[0].len(), 2);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_aggregation_request_wire_format() {
    let broker = InMemoryBroker::new();
    let bodies = Arc::new(Mutex::new(Vec::<Value>::new()));
    let connections = worker_connections(&broker);
    let worker = {
        let bodies = bodies.clone();
        RpcWorker::bind(
            &connections,
            "aggregator",
            &Topic::currency_aggregator().request_queue,
        )
        .await
        .unwrap()
        .serve(move |body: Vec<u8>| {
            let bodies = bodies.clone();
            async move {
                bodies.lock().unwrap().push(serde_json::from_slice(&body)?);
                Ok::<_, RpcError>(br#"{"euro":700.0,"rub":70000.0,"rsd":81900.0,"answer":700.0}"#.to_vec())
            }
        })
        .await
        .unwrap()
    };
    let gateway = gateway(&broker, Duration::from_secs(2));

    let summary = gateway
        .purchase_summary(purchases(), Currency::Eur, TimeoutPolicy::Fail)
        .await
        .unwrap();
    assert_eq!(serde_json::to_value(&summary).unwrap()["rsd"], json!(81900.0));

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies[0]["content"], "Purchases");
    assert_eq!(bodies[0]["current_currency"], "EUR");
    assert_eq!(bodies[0]["purchases"][0]["name"], "Moza R5");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_degrade_fills_in_sentinel() {
    let broker = InMemoryBroker::new();
    let gateway = gateway(&broker, Duration::from_millis(100));

    let summary = gateway
        .purchase_summary(purchases(), Currency::Eur, TimeoutPolicy::Degrade)
        .await
        .unwrap();

    assert!(!summary.totals.is_available());
    let value = serde_json::to_value(&summary).unwrap();
    for key in ["euro", "rub", "rsd", "answer"] {
        assert_eq!(value[key], NO_RESPONSE);
    }
    assert_eq!(value["purchases"][0]["price"], json!(700.0));
    assert_eq!(gateway.client().pending_calls(), 0);
}

#[tokio::test]
async fn test_fail_policy_surfaces_timeout() {
    let broker = InMemoryBroker::new();
    let gateway = gateway(&broker, Duration::from_millis(100));

    let err = gateway
        .income_summary(incomes(), Currency::Eur, TimeoutPolicy::Fail)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn test_degrade_does_not_hide_broker_errors() {
    let broker = InMemoryBroker::new();
    broker.set_reject_publishes(true);
    let gateway = gateway(&broker, Duration::from_millis(100));

    let err = gateway
        .income_summary(incomes(), Currency::Eur, TimeoutPolicy::Degrade)
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::PublishError(_)));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn test_build_report_returns_worker_bytes() {
    let broker = InMemoryBroker::new();
    let connections = worker_connections(&broker);
    let worker = RpcWorker::bind(&connections, "reports", &Topic::report_builder().request_queue)
        .await
        .unwrap()
        .serve(|body: Vec<u8>| async move {
            let request: ReportRequest = serde_json::from_slice(&body)?;
            let mut pdf = b"%PDF-1.4\n".to_vec();
            pdf.extend_from_slice(format!("{} categories\n", request.categories.len()).as_bytes());
            Ok::<_, RpcError>(pdf)
        })
        .await
        .unwrap();
    let gateway = gateway(&broker, Duration::from_secs(2));

    let request = ReportRequest {
        purchases: purchases(),
        incomes: incomes(),
        categories: vec![CategoryRecord {
            id: 9,
            owner_id: None,
            category_name: "Hobby".to_string(),
            is_root: true,
        }],
        start_date: day(),
        end_date: day(),
        current_currency: Currency::Eur,
    };
    let pdf = gateway.build_report(&request).await.unwrap();

    assert!(pdf.starts_with(b"%PDF"));
    assert!(String::from_utf8_lossy(&pdf).contains("1 categories"));

    worker.stop().await.unwrap();
}
