//! Prometheus metrics for the RTM client.
//!
//! Registered once into the process-default registry; exposition is the
//! embedding application's concern.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

fn latency_buckets_millis() -> Vec<f64> {
    vec![
        0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0,
        50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 150.0, 200.0, 250.0, 300.0, 400.0, 500.0, 600.0,
        700.0, 800.0, 900.0, 1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 10000.0, 25000.0, 50000.0,
        100000.0,
    ]
}

lazy_static! {
    pub static ref CLIENT_STARTS: IntCounter = register_int_counter!(
        "rtm_client_start_total",
        "Successful RTM client starts"
    )
    .expect("metric registration should succeed at startup");

    pub static ref CLIENT_ERRORS: IntCounterVec = register_int_counter_vec!(
        "rtm_client_errors_total",
        "RTM client errors by kind",
        &["type"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref ACTIONS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "rtm_actions_received_total",
        "Inbound PDUs by action",
        &["action"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "rtm_messages_received_total",
        "Subscription data PDUs by channel",
        &["channel"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref MESSAGES_RECEIVED_BYTES: IntCounterVec = register_int_counter_vec!(
        "rtm_messages_received_bytes_total",
        "Subscription data bytes by channel",
        &["channel"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref MESSAGES_SENT: IntCounterVec = register_int_counter_vec!(
        "rtm_messages_sent_total",
        "Published messages by channel",
        &["channel"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref MESSAGES_SENT_BYTES: IntCounterVec = register_int_counter_vec!(
        "rtm_messages_sent_bytes_total",
        "Published bytes by channel",
        &["channel"]
    )
    .expect("metric registration should succeed at startup");

    pub static ref MESSAGES_IN_PDU: Histogram = register_histogram!(
        "rtm_messages_in_pdu",
        "Messages carried by one subscription data PDU",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 100.0]
    )
    .expect("metric registration should succeed at startup");

    pub static ref BYTES_READ: IntCounter = register_int_counter!(
        "rtm_bytes_read_total",
        "Bytes read from the socket"
    )
    .expect("metric registration should succeed at startup");

    pub static ref BYTES_WRITTEN: IntCounter = register_int_counter!(
        "rtm_bytes_written_total",
        "Bytes written to the socket"
    )
    .expect("metric registration should succeed at startup");

    pub static ref PINGS_SENT: IntCounter = register_int_counter!(
        "rtm_pings_sent_total",
        "WebSocket pings sent"
    )
    .expect("metric registration should succeed at startup");

    pub static ref LAST_PING_TIME_SECONDS: IntGauge = register_int_gauge!(
        "rtm_last_ping_time_seconds",
        "Unix time of the most recent ping"
    )
    .expect("metric registration should succeed at startup");

    pub static ref LAST_PONG_TIME_SECONDS: IntGauge = register_int_gauge!(
        "rtm_last_pong_time_seconds",
        "Unix time of the most recent pong"
    )
    .expect("metric registration should succeed at startup");

    pub static ref PING_LATENCY_MILLIS: Histogram = register_histogram!(
        "rtm_ping_latency_millis",
        "Ping round-trip latency",
        latency_buckets_millis()
    )
    .expect("metric registration should succeed at startup");

    pub static ref PUBLISH_ACK_LATENCY_MILLIS: Histogram = register_histogram!(
        "rtm_publish_ack_latency_millis",
        "Latency between publish write and its ack",
        latency_buckets_millis()
    )
    .expect("metric registration should succeed at startup");

    pub static ref WRITE_DELAY_MICROSECONDS: Histogram = register_histogram!(
        "rtm_write_delay_microseconds",
        "Delay between request issue and write completion",
        vec![
            0.0, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2000.0, 3000.0,
            4000.0, 5000.0, 7500.0, 10000.0, 25000.0, 50000.0, 100000.0
        ]
    )
    .expect("metric registration should succeed at startup");

    pub static ref PENDING_WRITES: IntGauge = register_int_gauge!(
        "rtm_pending_requests",
        "Items queued for write on the socket"
    )
    .expect("metric registration should succeed at startup");

    pub static ref PUBLISH_INFLIGHT: IntGauge = register_int_gauge!(
        "rtm_publish_inflight_total",
        "Publishes written but not yet acked"
    )
    .expect("metric registration should succeed at startup");

    pub static ref SUBSCRIPTION_ERRORS: IntCounter = register_int_counter!(
        "rtm_subscription_error_total",
        "Server-side subscription errors"
    )
    .expect("metric registration should succeed at startup");

    pub static ref PUBLISH_ERRORS: IntCounter = register_int_counter!(
        "rtm_publish_error_total",
        "Publish request errors"
    )
    .expect("metric registration should succeed at startup");

    pub static ref SUBSCRIBE_ERRORS: IntCounter = register_int_counter!(
        "rtm_subscribe_error_total",
        "Subscribe request errors"
    )
    .expect("metric registration should succeed at startup");

    pub static ref UNSUBSCRIBE_ERRORS: IntCounter = register_int_counter!(
        "rtm_unsubscribe_error_total",
        "Unsubscribe request errors"
    )
    .expect("metric registration should succeed at startup");
}
