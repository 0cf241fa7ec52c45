// Router control-port client.
//
// Line-oriented protocol: one command out, reply lines back of the form
// `250-key=value` (continuation) and a final `250 OK` (or an error code).
// Only the handful of commands this crate needs are implemented.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use super::{CreatedService, OverlayError};

pub(crate) struct ControlClient<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ControlClient<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Cookie authentication; `cookie_hex` is the hex-encoded cookie file.
    pub(crate) async fn authenticate(&mut self, cookie_hex: &str) -> Result<(), OverlayError> {
        self.command(&format!("AUTHENTICATE {cookie_hex}")).await?;
        Ok(())
    }

    /// Create or re-install an ephemeral v3 service.
    ///
    /// `key` is `None` for a brand-new service (the router generates and
    /// returns the private key) or the stored `ED25519-V3:<blob>` string to
    /// re-bind an existing one. `ports` maps virtual ports to local ports.
    pub(crate) async fn add_onion(
        &mut self,
        key: Option<&str>,
        ports: &[(u16, u16)],
    ) -> Result<CreatedService, OverlayError> {
        let key_spec = key.unwrap_or("NEW:ED25519-V3");
        let mut command = format!("ADD_ONION {key_spec} Flags=Detach");
        for (virt, local) in ports {
            command.push_str(&format!(" Port={virt},127.0.0.1:{local}"));
        }

        let lines = self.command(&command).await?;
        let mut service_id = None;
        let mut private_key = key.map(str::to_string);
        for line in &lines {
            if let Some(value) = line.strip_prefix("ServiceID=") {
                service_id = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("PrivateKey=") {
                private_key = Some(value.to_string());
            }
        }

        match (service_id, private_key) {
            (Some(service_id), Some(private_key)) => Ok(CreatedService {
                service_id,
                private_key,
            }),
            _ => Err(OverlayError::Control(
                "ADD_ONION reply missing ServiceID".to_string(),
            )),
        }
    }

    pub(crate) async fn del_onion(&mut self, service_id: &str) -> Result<(), OverlayError> {
        self.command(&format!("DEL_ONION {service_id}")).await?;
        Ok(())
    }

    /// Send one command and collect the payloads of all reply lines.
    /// A final line with a code other than 250 is a control error.
    async fn command(&mut self, line: &str) -> Result<Vec<String>, OverlayError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        let mut payloads = Vec::new();
        loop {
            let mut reply = String::new();
            let n = self.stream.read_line(&mut reply).await?;
            if n == 0 {
                return Err(OverlayError::Control(
                    "control connection closed".to_string(),
                ));
            }
            let reply = reply.trim_end_matches(['\r', '\n']);
            if reply.len() < 4 {
                return Err(OverlayError::Control(format!("short reply: {reply:?}")));
            }
            let (code, separator, payload) = (&reply[..3], &reply[3..4], &reply[4..]);
            payloads.push(payload.to_string());
            match separator {
                "-" | "+" => continue,
                " " => {
                    if code == "250" {
                        return Ok(payloads);
                    }
                    return Err(OverlayError::Control(format!("{code} {payload}")));
                }
                _ => return Err(OverlayError::Control(format!("bad reply: {reply:?}"))),
            }
        }
    }
}
