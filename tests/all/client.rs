use crate::helpers::{get_client, pool_settings, settle, NOT_OPEN};
use carrot_pool::amqp::configuration::PoolSettings;
use carrot_pool::amqp::convenience::BasicPropertiesExt;
use carrot_pool::amqp::{BasicProperties, ExchangeKind};
use carrot_pool::client::{
    Client, ConsumeData, ExchangeData, PublishData, LOG_ID_HEADER, OP_UID_HEADER,
    SERVICE_HEADER,
};
use carrot_pool::pool::Error;
use fake::{Fake, Faker};
use futures_util::StreamExt;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn published_messages_carry_routing_information_and_headers() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    let log_id: String = Faker.fake();
    let message = PublishData::new("order.created", Faker.fake::<String>()).with_op_uid("operator-7");

    // Act
    client.publish(&message, &log_id).await.unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    let published = &published[0];
    assert_eq!(published.exchange, "carrot.default");
    assert_eq!(published.routing_key, "order.created");
    assert_eq!(published.payload, message.data);

    let properties = &published.properties;
    assert_eq!(
        properties.get_header_str(LOG_ID_HEADER).as_deref(),
        Some(log_id.as_str())
    );
    assert_eq!(
        properties.get_header_str(SERVICE_HEADER).as_deref(),
        Some("carrot-pool")
    );
    assert_eq!(
        properties.get_header_str(OP_UID_HEADER).as_deref(),
        Some("operator-7")
    );
    assert_eq!(
        properties.content_type().as_ref().map(|ct| ct.as_str()),
        Some("text/plain")
    );
    assert!(properties.message_id().is_some());
    assert!(properties.timestamp().is_some());
}

#[tokio::test(start_paused = true)]
async fn callers_can_override_the_exchange_the_service_and_the_content_type() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    let message = PublishData::new("invoice.paid", r#"{"amount": 10}"#)
        .with_exchange(ExchangeData::new("billing", "topic"))
        .with_service_name("billing-api")
        .with_content_type("application/json");

    // Act
    client.publish(&message, "log-1").await.unwrap();

    // Assert
    let published = broker.published();
    let properties = &published[0].properties;
    assert_eq!(published[0].exchange, "billing");
    assert_eq!(
        properties.get_header_str(SERVICE_HEADER).as_deref(),
        Some("billing-api")
    );
    assert_eq!(
        properties.content_type().as_ref().map(|ct| ct.as_str()),
        Some("application/json")
    );
    // Empty header values are not sent
    assert!(properties.get_header(OP_UID_HEADER).is_none());
}

#[tokio::test(start_paused = true)]
async fn publish_retries_exactly_once_on_a_closed_channel() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    broker.fail_next_publishes(1, NOT_OPEN);

    // Act
    client
        .publish(&PublishData::new("order.created", "payload"), "log-1")
        .await
        .unwrap();

    // Assert
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(client.pool().status().acquisitions, 2);
}

#[tokio::test(start_paused = true)]
async fn the_broker_signature_for_closed_channels_triggers_a_retry_too() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    broker.fail_next_publishes(
        1,
        "Exception (504) Reason: \"CHANNEL_ERROR - expected 'channel.open'\"",
    );

    // Act
    let outcome = client
        .publish(&PublishData::new("order.created", "payload"), "log-1")
        .await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_second_transient_failure_is_surfaced_to_the_caller() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    broker.fail_next_publishes(2, NOT_OPEN);

    // Act
    let err = client
        .publish(&PublishData::new("order.created", "payload"), "log-1")
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(
        err,
        Error::TransientTransport {
            operation: "publish",
            ..
        }
    ));
    assert!(broker.published().is_empty());
    assert_eq!(client.pool().status().acquisitions, 2);

    // Both channels were thrown away
    settle().await;
    assert_eq!(client.pool().status().live, 0);
}

#[tokio::test(start_paused = true)]
async fn other_publish_errors_are_not_retried() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    broker.fail_next_publishes(1, "NOT_FOUND - no exchange 'billing' in vhost '/'");

    // Act
    let err = client
        .publish(&PublishData::new("order.created", "payload"), "log-1")
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(
        err,
        Error::Protocol {
            operation: "publish",
            ..
        }
    ));
    assert!(err.to_string().contains("NOT_FOUND"));
    assert_eq!(client.pool().status().acquisitions, 1);
    // The broker closed the channel: it is not kept for reuse
    assert_eq!(client.pool().status().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_messages_are_rejected_before_any_channel_is_leased() {
    // Arrange
    let (client, broker) = get_client(pool_settings());

    // Act
    let missing_op_code = client
        .publish(&PublishData::new("", "payload"), "log-1")
        .await;
    let missing_payload = client
        .publish(&PublishData::new("order.created", Vec::<u8>::new()), "log-1")
        .await;

    // Assert
    assert!(matches!(missing_op_code, Err(Error::Validation(_))));
    assert!(matches!(missing_payload, Err(Error::Validation(_))));
    assert_eq!(client.pool().status().acquisitions, 0);
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn redeclaring_an_exchange_is_idempotent() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    let exchange = ExchangeData::new("orders", "topic");

    // Act
    client.declare_exchange(Some(&exchange)).await.unwrap();
    client.declare_exchange(Some(&exchange)).await.unwrap();

    // Assert
    assert_eq!(broker.exchange("orders"), Some((ExchangeKind::Topic, true)));
    assert_eq!(client.pool().status().idle, 1);
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn redeclaring_an_exchange_with_a_different_durability_fails() {
    // Arrange
    let (client, broker) = get_client(pool_settings());
    let exchange = ExchangeData::new("orders", "topic");
    client.declare_exchange(Some(&exchange)).await.unwrap();

    // Act
    let transient = ExchangeData {
        durable: false,
        ..exchange
    };
    let err = client.declare_exchange(Some(&transient)).await.unwrap_err();

    // Assert
    assert!(matches!(
        err,
        Error::Protocol {
            operation: "declare exchange",
            ..
        }
    ));
    assert_eq!(broker.exchange("orders"), Some((ExchangeKind::Topic, true)));
    // The channel the broker closed is not kept around
    settle().await;
    assert_eq!(client.pool().status().live, 0);
}

#[tokio::test(start_paused = true)]
async fn the_default_exchange_is_declared_when_none_is_given() {
    // Arrange
    let (client, broker) = get_client(pool_settings());

    // Act
    client.declare_exchange(None).await.unwrap();
    client
        .declare_exchange(Some(&ExchangeData::default()))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        broker.exchange("carrot.default"),
        Some((ExchangeKind::Direct, true))
    );
}

#[tokio::test(start_paused = true)]
async fn consumers_receive_published_messages_with_their_headers() {
    // Arrange
    let (client, _broker) = get_client(pool_settings());
    let queue_name = Uuid::new_v4().to_string();
    let mut consumer = client
        .consume(&ConsumeData::new(&queue_name, ["order.created"]).with_limit(10))
        .await
        .unwrap();
    let log_id: String = Faker.fake();

    // Act
    client
        .publish(
            &PublishData::new("order.created", "payload").with_service_name("checkout"),
            &log_id,
        )
        .await
        .unwrap();
    let delivery = consumer.next().await.unwrap().unwrap();

    // Assert
    let headers = Client::decode_headers(&delivery);
    assert_eq!(headers.exchange, "carrot.default");
    assert_eq!(headers.route_key, "order.created");
    assert_eq!(headers.log_id, log_id);
    assert_eq!(headers.service, "checkout");
    assert_eq!(headers.op_uid, "");
    assert_eq!(headers.content_type.as_deref(), Some("text/plain"));
    assert!(headers.message_id.is_some());
    assert_eq!(delivery.data, b"payload");

    delivery.ack().await.unwrap();
    consumer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_consumer_holds_its_channel_until_it_is_stopped() {
    // Arrange
    let settings = PoolSettings {
        max_idle_channel_time_ms: 100,
        ..pool_settings()
    };
    let (client, broker) = get_client(settings);
    let queue_name = Uuid::new_v4().to_string();

    // Act
    let consumer = client
        .consume(&ConsumeData::new(&queue_name, ["order.created", "order.paid"]).with_limit(5))
        .await
        .unwrap();

    // Assert
    let exchange = "carrot.default".to_owned();
    assert_eq!(
        broker.bindings(&queue_name),
        vec![
            (exchange.clone(), "order.created".to_owned()),
            (exchange, "order.paid".to_owned())
        ]
    );
    assert_eq!(broker.prefetch(), Some(5));
    assert_eq!(broker.consumers(&queue_name), 1);
    assert!(Uuid::parse_str(consumer.consumer_tag()).is_ok());

    // Idle channels would have been reaped by now
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = client.pool().status();
    assert_eq!(status.leased, 1);
    assert_eq!(status.idle, 0);

    consumer.stop().await.unwrap();
    settle().await;
    assert_eq!(client.pool().status().live, 0);
    assert_eq!(broker.consumers(&queue_name), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_consumer_releases_its_channel() {
    // Arrange
    let (client, _broker) = get_client(pool_settings());
    let consumer = client
        .consume(&ConsumeData::new("audit", ["order.created"]))
        .await
        .unwrap();
    assert_eq!(client.pool().status().leased, 1);

    // Act
    drop(consumer);
    settle().await;

    // Assert
    assert_eq!(client.pool().status().live, 0);
}

#[tokio::test(start_paused = true)]
async fn a_failed_consumer_setup_does_not_leak_its_channel() {
    // Arrange
    let (client, _broker) = get_client(pool_settings());
    client
        .declare_exchange(Some(&ExchangeData::new("orders", "topic")))
        .await
        .unwrap();

    // Act
    let request = ConsumeData::new("audit", ["order.created"])
        .with_exchange(ExchangeData::new("orders", "direct"));
    let err = client.consume(&request).await.unwrap_err();

    // Assert
    assert!(matches!(
        err,
        Error::Protocol {
            operation: "declare exchange",
            ..
        }
    ));
    settle().await;
    assert_eq!(client.pool().status().live, 0);
}

#[tokio::test(start_paused = true)]
async fn raw_channels_go_back_to_the_pool_when_dropped() {
    // Arrange
    let (client, broker) = get_client(pool_settings());

    // Act
    let channel = client.acquire_channel().await.unwrap();
    channel
        .publish("", "some-queue", b"raw", BasicProperties::default())
        .await
        .unwrap();
    drop(channel);

    // Assert
    assert_eq!(broker.published().len(), 1);
    assert_eq!(client.pool().status().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn operations_fail_once_the_client_is_closed() {
    // Arrange
    let (client, _broker) = get_client(pool_settings());
    client.declare_exchange(None).await.unwrap();

    // Act
    client.close().await;

    // Assert
    let outcome = client
        .publish(&PublishData::new("order.created", "payload"), "log-1")
        .await;
    assert!(matches!(outcome, Err(Error::Closed)));
    assert!(matches!(client.acquire_channel().await, Err(Error::Closed)));
}
