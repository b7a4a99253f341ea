pub mod aprs_is;
pub mod lines;
pub mod serial;

use futures_util::{
    StreamExt,
    pin_mut,
};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::source::lines::LineReader;

#[derive(Debug, thiserror::Error)]
#[error("source error")]
pub enum Error {
    Io(#[from] std::io::Error),
    Serial(#[from] serialport::Error),
    Lines(#[from] lines::Error),
    Join(#[from] tokio::task::JoinError),
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceConfig {
    /// A TNC on a serial port.
    Serial { device: String, baud_rate: u32 },
    /// Lines piped in, e.g. from `direwolf` or a log file.
    Stdin,
    AprsIs { address: String, filter: String },
}

impl SourceConfig {
    /// `-` reads from stdin, `I` connects to APRS-IS, anything else is a serial
    /// device.
    pub fn from_device(device: &str, baud_rate: u32, aprs_is_address: &str) -> Self {
        match device {
            "-" => SourceConfig::Stdin,
            "I" => {
                SourceConfig::AprsIs {
                    address: aprs_is_address.to_owned(),
                    filter: aprs_is::DEFAULT_FILTER.to_owned(),
                }
            }
            _ => {
                SourceConfig::Serial {
                    device: device.to_owned(),
                    baud_rate,
                }
            }
        }
    }

    /// Reads lines until the source ends or `shutdown` is cancelled.
    ///
    /// APRS-IS reconnects on its own and only stops on shutdown. For serial
    /// ports and stdin the end of the stream is the end.
    pub async fn run<P>(
        &self,
        call: &str,
        shutdown: CancellationToken,
        handle_line: P,
    ) -> Result<(), Error>
    where
        P: AsyncFnMut(String),
    {
        match self {
            SourceConfig::Serial { device, baud_rate } => {
                let stop_pump = shutdown.child_token();
                let (reader, pump) = serial::open(device, *baud_rate, stop_pump.clone())?;
                read_lines(reader, shutdown, handle_line).await?;
                stop_pump.cancel();
                pump.await??;
            }
            SourceConfig::Stdin => {
                read_lines(tokio::io::stdin(), shutdown, handle_line).await?;
            }
            SourceConfig::AprsIs { address, filter } => {
                let connector = aprs_is::TcpConnector::new(address);
                aprs_is::run(&connector, call, filter, shutdown, handle_line).await?;
            }
        }

        Ok(())
    }
}

async fn read_lines<R, P>(
    reader: R,
    shutdown: CancellationToken,
    mut handle_line: P,
) -> Result<(), Error>
where
    R: AsyncRead,
    P: AsyncFnMut(String),
{
    let lines = LineReader::new(reader);
    pin_mut!(lines);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            line = lines.next() => {
                match line {
                    None => break,
                    Some(Err(error)) if error.is_fatal() => return Err(error.into()),
                    Some(Err(error)) => {
                        tracing::debug!(?error, "skipping line");
                    }
                    Some(Ok(line)) => {
                        handle_line(line).await;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use crate::source::{
        SourceConfig,
        read_lines,
    };

    #[test]
    fn it_picks_the_source_from_the_device() {
        assert_eq!(
            SourceConfig::from_device("-", 9600, "rotate.aprs2.net:14580"),
            SourceConfig::Stdin
        );
        assert_eq!(
            SourceConfig::from_device("I", 9600, "rotate.aprs2.net:14580"),
            SourceConfig::AprsIs {
                address: "rotate.aprs2.net:14580".to_owned(),
                filter: "u/APECAN".to_owned()
            }
        );
        assert_eq!(
            SourceConfig::from_device("/dev/ttyUSB0", 38400, "rotate.aprs2.net:14580"),
            SourceConfig::Serial {
                device: "/dev/ttyUSB0".to_owned(),
                baud_rate: 38400
            }
        );
    }

    #[tokio::test]
    async fn it_reads_until_the_end_of_the_stream() {
        let input: &[u8] = b"one\r\n\xff\r\ntwo\r\n";
        let mut lines = vec![];
        read_lines(input, CancellationToken::new(), async |line| lines.push(line))
            .await
            .unwrap();
        assert_eq!(lines, ["one", "two"]);
    }

    #[tokio::test]
    async fn it_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut lines: Vec<String> = vec![];
        read_lines(reader, shutdown, async |line| lines.push(line))
            .await
            .unwrap();
        assert!(lines.is_empty());
    }
}
