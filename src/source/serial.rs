//! Serial TNCs
//!
//! `serialport` is blocking, so the port is read on a blocking task which
//! pipes everything into an in-memory stream for the async line reader.

use std::{
    io::Read,
    time::Duration,
};

use tokio::{
    io::{
        AsyncWriteExt,
        DuplexStream,
    },
    runtime::Handle,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::source::Error;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const PIPE_SIZE: usize = 4096;

/// Opens the port and starts reading from it.
///
/// The returned stream ends when the port does, or when `shutdown` is
/// cancelled. Read errors are returned from the join handle.
pub fn open(
    device: &str,
    baud_rate: u32,
    shutdown: CancellationToken,
) -> Result<(DuplexStream, JoinHandle<Result<(), Error>>), Error> {
    let port = serialport::new(device, baud_rate)
        .timeout(READ_TIMEOUT)
        .open()?;
    tracing::info!(%device, baud_rate, "opened serial port");

    let (reader, writer) = tokio::io::duplex(PIPE_SIZE);
    let handle = Handle::current();
    let join_handle =
        tokio::task::spawn_blocking(move || pump(port, writer, &handle, &shutdown));

    Ok((reader, join_handle))
}

fn pump<R: Read>(
    mut port: R,
    mut writer: DuplexStream,
    handle: &Handle,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let mut buffer = [0; 1024];

    while !shutdown.is_cancelled() {
        match port.read(&mut buffer) {
            Ok(0) => break,
            Ok(num_bytes_read) => {
                if handle
                    .block_on(writer.write_all(&buffer[..num_bytes_read]))
                    .is_err()
                {
                    // reader is gone
                    break;
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {}
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}
