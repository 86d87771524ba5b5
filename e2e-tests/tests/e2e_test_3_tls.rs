// E2E Test 3: TLS upgrades
// STARTTLS on SMTP and STLS on POP3 against a self-signed certificate.

mod e2e;

use e2e::helpers::{connector_for, generate_tls_files, TestEnv};
use e2e::pop3_client::Pop3TestClient;
use e2e::smtp_client::SmtpTestClient;

#[tokio::test]
async fn test_e2e_3_starttls_then_stls() {
    let env = TestEnv::start_with(|config, dir| {
        let (cert, key) = generate_tls_files(dir);
        let cert = cert.to_string_lossy().into_owned();
        let key = key.to_string_lossy().into_owned();
        config.smtp.tls_enabled = true;
        config.smtp.tls_cert_path = Some(cert.clone());
        config.smtp.tls_key_path = Some(key.clone());
        config.pop3.tls_enabled = true;
        config.pop3.tls_cert_path = Some(cert);
        config.pop3.tls_key_path = Some(key);
    })
    .await;
    let connector = connector_for(&env.dir.path().join("cert.pem"));

    let mut smtp = SmtpTestClient::connect(env.smtp_addr()).await.unwrap();
    let capabilities = smtp.ehlo("test-client").await.unwrap();
    assert!(capabilities.contains("250-STARTTLS"), "{}", capabilities);

    let mut smtp = smtp.starttls(&connector).await.unwrap();
    let capabilities = smtp.ehlo("test-client").await.unwrap();
    assert!(!capabilities.contains("STARTTLS"), "{}", capabilities);
    smtp.send_email("a@example.com", &["secret@example.com"], "sealed", "body")
        .await
        .unwrap();
    smtp.quit().await.unwrap();

    let mut pop3 = Pop3TestClient::connect(env.pop3_addr()).await.unwrap();
    let (_, capabilities) = pop3.multiline("CAPA").await.unwrap();
    assert!(capabilities.contains(&"STLS".to_string()));

    let mut pop3 = pop3.stls(&connector).await.unwrap();
    assert!(pop3.command("STLS").await.unwrap().starts_with("-ERR"));
    pop3.login("secret").await.unwrap();
    let message = pop3.retr(1).await.unwrap();
    assert!(message.contains(&"Subject: sealed".to_string()));
    pop3.quit().await.unwrap();

    env.shutdown().await;
}
