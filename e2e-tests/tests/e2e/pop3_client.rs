use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub struct Pop3TestClient<S = TcpStream> {
    stream: BufReader<S>,
}

impl Pop3TestClient<TcpStream> {
    /// Connect to POP3 server
    pub async fn connect(addr: SocketAddr) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect to POP3: {}", e))?;

        let mut client = Self {
            stream: BufReader::new(stream),
        };

        let greeting = client.read_line().await?;
        if !greeting.starts_with("+OK") {
            return Err(format!("Unexpected greeting: {}", greeting));
        }

        Ok(client)
    }

    /// Send STLS and upgrade the connection
    pub async fn stls(
        mut self,
        connector: &TlsConnector,
    ) -> Result<Pop3TestClient<TlsStream<TcpStream>>, String> {
        let response = self.command("STLS").await?;
        if !response.starts_with("+OK") {
            return Err(format!("STLS refused: {}", response));
        }

        let stream = connector
            .connect(super::helpers::localhost(), self.stream.into_inner())
            .await
            .map_err(|e| format!("TLS handshake failed: {}", e))?;
        Ok(Pop3TestClient {
            stream: BufReader::new(stream),
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Pop3TestClient<S> {
    /// USER then PASS; returns the PASS reply
    pub async fn login(&mut self, user: &str) -> Result<String, String> {
        let response = self.command(&format!("USER {}", user)).await?;
        if !response.starts_with("+OK") {
            return Err(format!("USER failed: {}", response));
        }
        let response = self.command("PASS anything").await?;
        if !response.starts_with("+OK") {
            return Err(format!("PASS failed: {}", response));
        }
        Ok(response)
    }

    /// Message count and total size from STAT
    pub async fn stat(&mut self) -> Result<(usize, u64), String> {
        let response = self.command("STAT").await?;
        let mut fields = response.split_whitespace().skip(1);
        match (fields.next(), fields.next()) {
            (Some(count), Some(size)) if response.starts_with("+OK") => Ok((
                count.parse().map_err(|_| format!("Bad STAT reply: {}", response))?,
                size.parse().map_err(|_| format!("Bad STAT reply: {}", response))?,
            )),
            _ => Err(format!("STAT failed: {}", response)),
        }
    }

    /// Fetch a message, undoing the dot-stuffing
    pub async fn retr(&mut self, number: usize) -> Result<Vec<String>, String> {
        let (status, lines) = self.multiline(&format!("RETR {}", number)).await?;
        if !status.starts_with("+OK") {
            return Err(format!("RETR failed: {}", status));
        }
        Ok(lines
            .into_iter()
            .map(|l| l.strip_prefix('.').map(str::to_string).unwrap_or(l))
            .collect())
    }

    /// Sends a command whose successful reply is a dot-terminated list.
    /// On `-ERR` the list is empty.
    pub async fn multiline(&mut self, command: &str) -> Result<(String, Vec<String>), String> {
        let status = self.command(command).await?;
        let mut lines = Vec::new();
        if !status.starts_with("+OK") {
            return Ok((status, lines));
        }
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok((status, lines));
            }
            lines.push(line);
        }
    }

    /// Send QUIT command
    pub async fn quit(mut self) -> Result<String, String> {
        self.command("QUIT").await
    }

    /// Send a command and read the status line
    pub async fn command(&mut self, command: &str) -> Result<String, String> {
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
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<String, String> {
        let mut line = String::new();
        let read = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        if read == 0 {
            return Err("Connection closed".to_string());
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
