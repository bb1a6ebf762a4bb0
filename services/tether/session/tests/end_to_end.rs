mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{echo_host, free_port, local, test_config, wait_until};
use tether_session::{
    ChangeReason, Notification, NotificationCallback, RemoteClient, SessionError, StopMode, Subject,
};
use tether_wire::Frame;
use tokio::sync::mpsc;

struct Forward(mpsc::UnboundedSender<Notification>);

#[async_trait]
impl NotificationCallback for Forward {
    async fn notify(&self, notification: Notification) {
        let _ = self.0.send(notification);
    }
}

#[tokio::test]
async fn test_session_lifecycle() {
    let config = Arc::new(test_config());
    let (primary_port, pooled_port) = (free_port(), free_port());
    let host = echo_host(&config, &[primary_port, pooled_port]).await;

    let client = RemoteClient::connect(local(primary_port), config.clone())
        .await
        .unwrap();
    assert_eq!(host.connected_client_count(), 1);
    let session = host.connected_client(&client.client_id()).unwrap();
    assert_eq!(session.handler_count(), 1);

    let pooled = client.take_connection(pooled_port).await.unwrap();
    assert_eq!(session.handler_count(), 2);
    assert_eq!(pooled.client_id().unwrap(), client.client_id());
    assert_ne!(
        pooled.handler_id().unwrap(),
        client.primary().handler_id().unwrap()
    );

    let frame = Frame::with_error_payload(120, 4, b"round trip".to_vec()).unwrap();
    pooled.send_frame(&frame).await.unwrap();
    assert_eq!(pooled.receive_frame().await.unwrap(), frame);

    client.release_connection(pooled.clone()).unwrap();
    assert_eq!(client.idle_connections(), 1);
    let reused = client.take_connection(pooled_port).await.unwrap();
    assert!(Arc::ptr_eq(&pooled, &reused));
    assert_eq!(session.handler_count(), 2);
    client.release_connection(reused).unwrap();

    client.disconnect().await.unwrap();
    wait_until(|| session.handler_count() == 0).await;
    wait_until(|| host.connected_client_count() == 0).await;

    host.close().await;
}

#[tokio::test]
async fn test_primary_channel_echo() {
    let config = Arc::new(test_config());
    let port = free_port();
    let host = echo_host(&config, &[port]).await;

    let client = RemoteClient::connect(local(port), config).await.unwrap();
    for command in [100, 200, 300] {
        let frame = Frame::with_payload(command, vec![command as u8; 1024]).unwrap();
        client.primary().send_frame(&frame).await.unwrap();
        assert_eq!(client.primary().receive_frame().await.unwrap(), frame);
    }

    let control = Frame::control_with_error(150, 9).unwrap();
    client.primary().send_frame(&control).await.unwrap();
    assert_eq!(client.primary().receive_frame().await.unwrap(), control);

    client.disconnect().await.unwrap();
    wait_until(|| host.connected_client_count() == 0).await;
    host.close().await;
}

#[tokio::test]
async fn test_hard_stop_through_primary() {
    let config = Arc::new(test_config());
    let (primary_port, pooled_port) = (free_port(), free_port());
    let host = echo_host(&config, &[primary_port, pooled_port]).await;
    let mut events = host.subscribe();

    let client = RemoteClient::connect(local(primary_port), config.clone())
        .await
        .unwrap();
    let session = host.connected_client(&client.client_id()).unwrap();
    let pooled = client.take_connection(pooled_port).await.unwrap();
    let pooled_id = pooled.handler_id().unwrap();
    assert_eq!(session.handler_count(), 2);

    client
        .disconnect_from_handler(&pooled, StopMode::Hard)
        .await
        .unwrap();
    wait_until(|| session.handler_count() == 1).await;
    assert!(session.handler(&pooled_id).is_none());
    assert!(pooled.is_closed());

    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        if event.reason == ChangeReason::HandlerRemoved && event.subject == Subject::Handler(pooled_id) {
            removed = true;
        }
    }
    assert!(removed);

    // The primary channel is untouched
    let frame = Frame::with_payload(100, b"still here".to_vec()).unwrap();
    client.primary().send_frame(&frame).await.unwrap();
    assert_eq!(client.primary().receive_frame().await.unwrap(), frame);

    client.disconnect().await.unwrap();
    wait_until(|| host.connected_client_count() == 0).await;
    host.close().await;
}

#[tokio::test]
async fn test_host_close_stops_sessions() {
    let config = Arc::new(test_config());
    let port = free_port();
    let host = echo_host(&config, &[port]).await;

    let first = RemoteClient::connect(local(port), config.clone()).await.unwrap();
    let second = RemoteClient::connect(local(port), config.clone()).await.unwrap();
    assert_ne!(first.client_id(), second.client_id());
    assert_eq!(host.connected_client_count(), 2);

    host.close().await;
    assert_eq!(host.connected_client_count(), 0);
    assert!(!host.is_open());
    assert!(first.primary().receive_frame().await.is_err());
}

#[tokio::test]
async fn test_acceptor_registration() {
    let config = Arc::new(test_config());
    let port = free_port();
    let host = echo_host(&config, &[port]).await;

    assert!(matches!(
        host.add_acceptor(port, Arc::new(common::EchoFactory)).await,
        Err(tether_session::SessionError::DuplicateAcceptor(p)) if p == port
    ));

    host.remove_acceptor(port).await.unwrap();
    assert!(matches!(
        host.remove_acceptor(port).await,
        Err(tether_session::SessionError::AcceptorNotFound(_))
    ));
    assert!(RemoteClient::connect(local(port), config).await.is_err());
    host.close().await;
}

#[tokio::test]
async fn test_host_pushes_notification() {
    let config = Arc::new(test_config());
    let port = free_port();
    let host = echo_host(&config, &[port]).await;

    let client = RemoteClient::connect(local(port), config).await.unwrap();
    let session = host.connected_client(&client.client_id()).unwrap();
    let primary_id = client.primary().handler_id().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(client
        .listener()
        .register(primary_id, 310, Arc::new(Forward(tx)))
        .is_none());
    client.listener().start();
    client.listener().start();
    assert!(client.listener().is_running());

    let server_side = session.handler(&primary_id).unwrap().channel().clone();
    let unhandled = Notification {
        handler_id: primary_id,
        command: 311,
    };
    let pushed = Notification {
        handler_id: primary_id,
        command: 310,
    };
    server_side.send_frame(&unhandled.to_frame().unwrap()).await.unwrap();
    server_side.send_frame(&pushed.to_frame().unwrap()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, pushed);
    assert!(rx.try_recv().is_err());

    client.listener().unregister(primary_id, 310).unwrap();
    assert!(matches!(
        client.listener().unregister(primary_id, 310),
        Err(SessionError::CallbackNotFound { command: 310, .. })
    ));
    assert_eq!(client.listener().callback_count(), 0);

    client.disconnect().await.unwrap();
    assert!(!client.listener().is_running());
    wait_until(|| host.connected_client_count() == 0).await;
    host.close().await;
}
