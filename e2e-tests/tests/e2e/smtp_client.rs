use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub struct SmtpTestClient<S = TcpStream> {
    stream: BufReader<S>,
}

impl SmtpTestClient<TcpStream> {
    /// Connect to SMTP server
    pub async fn connect(addr: SocketAddr) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect to SMTP: {}", e))?;

        let mut client = Self {
            stream: BufReader::new(stream),
        };

        // Read greeting
        let greeting = client.read_response().await?;
        if !greeting.starts_with("220") {
            return Err(format!("Unexpected greeting: {}", greeting));
        }

        Ok(client)
    }

    /// Send STARTTLS and upgrade the connection
    pub async fn starttls(
        mut self,
        connector: &TlsConnector,
    ) -> Result<SmtpTestClient<TlsStream<TcpStream>>, String> {
        self.send_command("STARTTLS").await?;
        let response = self.read_response().await?;
        if !response.starts_with("220") {
            return Err(format!("STARTTLS refused: {}", response));
        }

        let stream = connector
            .connect(super::helpers::localhost(), self.stream.into_inner())
            .await
            .map_err(|e| format!("TLS handshake failed: {}", e))?;
        Ok(SmtpTestClient {
            stream: BufReader::new(stream),
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpTestClient<S> {
    /// Send EHLO command
    pub async fn ehlo(&mut self, hostname: &str) -> Result<String, String> {
        self.command(&format!("EHLO {}", hostname)).await
    }

    /// Send MAIL FROM command
    pub async fn mail_from(&mut self, from: &str) -> Result<String, String> {
        self.command(&format!("MAIL FROM:<{}>", from)).await
    }

    /// Send RCPT TO command
    pub async fn rcpt_to(&mut self, to: &str) -> Result<String, String> {
        self.command(&format!("RCPT TO:<{}>", to)).await
    }

    /// Send DATA command and email content
    pub async fn data(&mut self, content: &str) -> Result<String, String> {
        let response = self.command("DATA").await?;
        if !response.starts_with("354") {
            return Err(format!("DATA command failed: {}", response));
        }

        // Send email content
        self.send_command(content).await?;
        self.send_command(".").await?;
        self.read_response().await
    }

    /// Send QUIT command
    pub async fn quit(mut self) -> Result<String, String> {
        self.command("QUIT").await
    }

    /// Send a command and read its reply
    pub async fn command(&mut self, command: &str) -> Result<String, String> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Send a command
    async fn send_command(&mut self, command: &str) -> Result<(), String> {
        let line = format!("{}\r\n", command);
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("Failed to send command: {}", e))?;

        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| format!("Failed to flush: {}", e))?;
        Ok(())
    }

    /// Read a response (handles multi-line responses like EHLO)
    async fn read_response(&mut self) -> Result<String, String> {
        let mut full_response = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            self.stream
                .read_line(&mut line)
                .await
                .map_err(|e| format!("Failed to read response: {}", e))?;

            if line.is_empty() {
                break; // Connection closed
            }

            full_response.push_str(&line);

            // "250-..." continues, "250 ..." ends the reply
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                break;
            }
        }

        Ok(full_response.trim().to_string())
    }

    /// Send a complete email to every recipient in `to`
    pub async fn send_email(
        &mut self,
        from: &str,
        to: &[&str],
        subject: &str,
        body: &str,
    ) -> Result<(), String> {
        self.ehlo("test-client").await?;
        self.mail_from(from).await?;
        for rcpt in to {
            let response = self.rcpt_to(rcpt).await?;
            if !response.starts_with("250") {
                return Err(format!("Recipient {} rejected: {}", rcpt, response));
            }
        }

        let email_content = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}",
            from,
            to.join(", "),
            subject,
            body
        );

        let response = self.data(&email_content).await?;
        if !response.starts_with("250") {
            return Err(format!("Email rejected: {}", response));
        }

        Ok(())
    }
}
