//! S2 — supersede on re-ingest: a business key that already has an
//! effective row gets a compensating `sign=-1` copy before the new row
//! lands, so `sum(sign)` for that key is `1` afterward.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use httpmock::MockServer;
use mq_audit::AuditSink;
use mq_broker::{Broker, Delivery};
use mq_ingest::{drain_queue, WorkerOutcome};
use mq_store::StoreGateway;
use mq_transform::{Registry as TransformRegistry, TransformerDescriptor};

struct FakeBroker {
    deliveries: Mutex<std::collections::VecDeque<Delivery>>,
    acked: Mutex<Vec<u64>>,
}

impl FakeBroker {
    fn with_bodies(bodies: Vec<(u64, &str)>) -> Self {
        let deliveries = bodies
            .into_iter()
            .map(|(tag, body)| Delivery {
                delivery_tag: tag,
                body: body.as_bytes().to_vec(),
            })
            .collect();
        Self {
            deliveries: Mutex::new(deliveries),
            acked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Broker for FakeBroker {
    async fn get_one(&self, _queue: &str) -> Result<Option<Delivery>> {
        Ok(self.deliveries.lock().unwrap().pop_front())
    }

    async fn depth(&self, _queue: &str) -> Result<u32> {
        Ok(self.deliveries.lock().unwrap().len() as u32)
    }

    async fn ack_multiple(&self, delivery_tag: u64) -> Result<()> {
        self.acked.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, _multiple: bool) -> Result<()> {
        panic!("this scenario must not nack");
    }
}

fn orders_descriptor() -> TransformerDescriptor {
    TransformerDescriptor {
        report_name: "OrdersReport".to_string(),
        table_name: "orders_report".to_string(),
        database_name: "DataCore".to_string(),
        business_key_column: "key_id".to_string(),
        original_date_sentinel_column: None,
        float_columns: vec![],
        int_columns: vec![],
        date_columns: vec![],
        datetime_columns: vec![],
        bool_columns: vec![],
        expected_column_set: vec![
            "key_id".to_string(),
            "amount".to_string(),
            "sign".to_string(),
            "original_file_parsed_on".to_string(),
            "is_obsolete_date".to_string(),
        ],
        lowercase_keys: false,
    }
}

#[tokio::test]
async fn supersede_flips_prior_row_sign_before_inserting_new_one() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .query_param("query", "DESCRIBE TABLE DataCore.orders_report FORMAT JSONEachRow");
        then.status(200).body(
            "{\"name\":\"uuid\",\"type\":\"UUID\"}\n\
             {\"name\":\"key_id\",\"type\":\"String\"}\n\
             {\"name\":\"amount\",\"type\":\"Float64\"}\n\
             {\"name\":\"sign\",\"type\":\"Int8\"}\n\
             {\"name\":\"original_file_parsed_on\",\"type\":\"String\"}\n\
             {\"name\":\"is_obsolete_date\",\"type\":\"String\"}\n",
        );
    });

    // Pre-state: one effective row for K1 (sign=+1, from file f1).
    server.mock(|when, then| {
        when.method(httpmock::Method::POST).query_param(
            "query",
            "SELECT * FROM DataCore.orders_report WHERE uuid IN (SELECT uuid FROM DataCore.orders_report WHERE key_id IN ('K1') GROUP BY uuid HAVING SUM(sign) > 0) FORMAT JSONCompact",
        );
        then.status(200).json_body(serde_json::json!({
            "meta": [
                {"name": "uuid"}, {"name": "key_id"}, {"name": "amount"},
                {"name": "sign"}, {"name": "original_file_parsed_on"}, {"name": "is_obsolete_date"}
            ],
            "data": [["u1", "K1", 10, 1, "f1", "2024-05-27 00:00:00"]]
        }));
    });

    // Compensating insert carries the full column list returned by the
    // supersede SELECT (including `uuid`), with `sign` flipped to -1.
    let compensate_mock = server.mock(|when, then| {
        when.method(httpmock::Method::POST).query_param(
            "query",
            "INSERT INTO DataCore.orders_report (uuid, key_id, amount, sign, original_file_parsed_on, is_obsolete_date) FORMAT JSONEachRow",
        );
        then.status(200);
    });

    // New-row insert uses the transformer's own column order (no `uuid`).
    let new_row_mock = server.mock(|when, then| {
        when.method(httpmock::Method::POST).query_param(
            "query",
            "INSERT INTO DataCore.orders_report (key_id, amount, sign, original_file_parsed_on, is_obsolete_date) FORMAT JSONEachRow",
        );
        then.status(200);
    });

    server.mock(|when, then| {
        when.method(httpmock::Method::POST).query_param(
            "query",
            "INSERT INTO DataCore.rmq_log (database, table, queue, key_id, datetime, is_success, message) FORMAT JSONEachRow",
        );
        then.status(200);
    });

    let store = StoreGateway::new(&server.base_url(), "user", "pass").unwrap();
    let transformers = TransformRegistry::from_descriptors(vec![orders_descriptor()]);
    let audit = AuditSink::new(tempfile::tempdir().unwrap().path());
    let quarantine = Mutex::new(HashSet::new());

    let body = br#"{"header":{"report":"OrdersReport","key_id":"K1"},"data":[{"key_id":"K1","amount":20}]}"#;
    let broker = FakeBroker::with_bodies(vec![(1, std::str::from_utf8(body).unwrap())]);

    let outcome = drain_queue(&broker, &store, &transformers, &audit, "Q1", 5000, &quarantine).await;

    match outcome {
        WorkerOutcome::Done { processed, .. } => assert_eq!(processed, 1),
        other => panic!("expected Done, got {other:?}"),
    }
    assert_eq!(*broker.acked.lock().unwrap(), vec![1]);
    compensate_mock.assert();
    new_row_mock.assert();
}
