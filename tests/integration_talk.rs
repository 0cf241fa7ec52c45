// Messaging and trust-anchor behavior of the talk server.

mod common;

use std::sync::Arc;

use common::{pair, recv_message, spawn_node, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn message_delivery_and_attribution() {
    let mut a = spawn_node("a", true).await;
    let b = spawn_node("b", true).await;
    pair(&b, &a).await;

    let a_digest = b.app.friends()[0].digest();
    wait_until("b's connection to a", || b.app.is_active(&a_digest)).await;

    assert!(b.app.send(&a_digest, "hi").await.unwrap());

    let message = recv_message(&mut a).await;
    assert_eq!(message.sender.name, "b");
    assert_eq!(message.content_type, "text/plain");
    assert_eq!(message.text().unwrap(), "hi");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_arrive_in_send_order() {
    let mut a = spawn_node("a", true).await;
    let b = spawn_node("b", true).await;
    pair(&b, &a).await;

    let a_digest = b.app.friends()[0].digest();
    wait_until("b's connection to a", || b.app.is_active(&a_digest)).await;

    for text in ["one", "two", "three"] {
        assert!(b.app.send(&a_digest, text).await.unwrap());
    }

    for expected in ["one", "two", "three"] {
        let message = recv_message(&mut a).await;
        assert_eq!(message.text().unwrap(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trust_anchor_refresh_keeps_existing_sessions() {
    let mut a = spawn_node("a", true).await;
    let b = spawn_node("b", true).await;
    let c = spawn_node("c", true).await;

    pair(&b, &a).await;
    let a_digest = b.app.friends()[0].digest();
    wait_until("b's connection to a", || b.app.is_active(&a_digest)).await;
    assert!(b.app.send(&a_digest, "before refresh").await.unwrap());
    assert_eq!(recv_message(&mut a).await.text().unwrap(), "before refresh");

    // Adding c re-arms a's talk server with a fresh trust snapshot.
    pair(&c, &a).await;
    assert_eq!(a.app.friends().len(), 2);

    // b's established session keeps working across the refresh
    assert!(b.app.send(&a_digest, "after refresh").await.unwrap());
    assert_eq!(recv_message(&mut a).await.text().unwrap(), "after refresh");

    // ...and c's brand-new certificate is now accepted at TLS
    let a_digest_for_c = c.app.friends()[0].digest();
    wait_until("c's connection to a", || c.app.is_active(&a_digest_for_c)).await;
    assert!(c.app.send(&a_digest_for_c, "hello from c").await.unwrap());
    let message = recv_message(&mut a).await;
    assert_eq!(message.sender.name, "c");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stranger_certificate_rejected_at_tls() {
    let a = spawn_node("a", true).await;
    let b = spawn_node("b", true).await;
    pair(&b, &a).await;

    // A certificate nobody ever accepted, dialed straight at a's talk
    // port while pinning a's real certificate.
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["stranger.onion".to_string()]).unwrap();
    let stranger_cert = params.self_signed(&key_pair).unwrap();

    let a_cert_pem = b.app.friends()[0].cert_pem.clone();
    let config = slick::tls::client_config(
        &stranger_cert.pem(),
        &key_pair.serialize_pem(),
        &a_cert_pem,
    )
    .unwrap();

    let talk_addr = a.app.advertisement().await.unwrap().talk_addr();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("a.onion".to_string()).unwrap();

    let attempt = async {
        let tcp = TcpStream::connect(talk_addr).await?;
        let mut tls = connector.connect(server_name, tcp).await?;
        tls.write_all(b"HEAD / HTTP/1.1\r\ncontent-length: 0\r\n\r\n")
            .await?;
        tls.flush().await?;
        let mut byte = [0u8; 1];
        tls.read_exact(&mut byte).await?;
        Ok::<(), std::io::Error>(())
    };
    assert!(attempt.await.is_err(), "stranger should be refused at TLS");

    // The friend still gets through afterwards
    let a_digest = b.app.friends()[0].digest();
    wait_until("b's connection to a", || b.app.is_active(&a_digest)).await;
    assert!(b.app.send(&a_digest, "still here").await.unwrap());
}
