//! One-shot frame transmission.

use {
    crate::{
        Cli, CliError,
        display::hex_dump,
        serial::{prepare_port, write_all},
        was_interrupted,
    },
    anyhow::{Context, Result, bail},
    console::style,
    std::{
        sync::mpsc::{Receiver, RecvTimeoutError},
        time::{Duration, Instant},
    },
    zbserial::{PortEvent, SerialPort, format_hex},
};

/// Longest single wait on the event channel, so Ctrl-C is noticed promptly.
const EVENT_SLICE: Duration = Duration::from_millis(50);

/// Parse `"01 02 03"`, `"010203"`, `"0x01,0x02"` style input.
pub(crate) fn parse_hex_bytes(args: &[String]) -> Result<Vec<u8>, String> {
    let tokens = args
        .iter()
        .flat_map(|arg| arg.split(|c: char| c.is_whitespace() || c == ',' || c == ':'))
        .filter(|token| !token.is_empty());

    let mut bytes = Vec::new();
    for token in tokens {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        let invalid = || format!("invalid hex token '{token}'");
        if digits.is_empty()
            || digits.len() % 2 != 0
            || !digits.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(invalid());
        }
        for pair in digits.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
            bytes.push(u8::from_str_radix(pair, 16).map_err(|_| invalid())?);
        }
    }

    if bytes.is_empty() {
        return Err("nothing to send".to_string());
    }
    Ok(bytes)
}

/// Drain everything the driver has buffered.
fn read_available(port: &mut SerialPort, reply: &mut Vec<u8>) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let n = port
            .read(&mut buf)
            .with_context(|| format!("Read from {} failed", port.identifier()))?;
        reply.extend_from_slice(&buf[..n]);
        if n < buf.len() {
            return Ok(());
        }
    }
}

/// Collect reply bytes until `window` has elapsed.
fn collect_reply(
    port: &mut SerialPort,
    events: &Receiver<PortEvent>,
    window: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + window;
    let mut reply = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline || was_interrupted() {
            return Ok(reply);
        }

        match events.recv_timeout((deadline - now).min(EVENT_SLICE)) {
            Ok(PortEvent::DataAvailable) => read_available(port, &mut reply)?,
            Ok(PortEvent::Error | PortEvent::Closed) => {
                bail!("Port {} failed while waiting for a reply", port.identifier())
            },
            Ok(PortEvent::Opened) | Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => return Ok(reply),
        }
    }
}

/// Send command implementation.
pub(crate) fn cmd_send(cli: &Cli, data: &[String], wait_ms: u64) -> Result<()> {
    let payload = parse_hex_bytes(data).map_err(CliError::Usage)?;

    let mut port = prepare_port(cli)?;
    let events = port.events();
    port.open()
        .with_context(|| format!("Failed to open {}", port.identifier()))?;

    write_all(&mut port, &payload)?;
    eprintln!(
        "{} Sent {} byte(s) to {}: {}",
        style("→").green(),
        payload.len(),
        style(port.identifier()).cyan(),
        format_hex(&payload)
    );

    let reply = collect_reply(&mut port, &events, Duration::from_millis(wait_ms))?;
    if reply.is_empty() {
        eprintln!("{}", style("No reply").dim());
    } else {
        eprintln!(
            "{} Received {} byte(s)",
            style("←").green(),
            reply.len()
        );
        print!("{}", hex_dump(&reply));
    }

    port.close()
        .with_context(|| format!("Failed to close {}", port.identifier()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    #[test]
    fn test_parse_spaced_bytes() {
        assert_eq!(parse_hex_bytes(&args(&["01 02 03"])), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_packed_bytes() {
        assert_eq!(parse_hex_bytes(&args(&["010203"])), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_prefixed_and_separated_tokens() {
        assert_eq!(
            parse_hex_bytes(&args(&["0x7E,0XFF", "aa:bb"])),
            Ok(vec![0x7e, 0xff, 0xaa, 0xbb])
        );
    }

    #[test]
    fn test_parse_rejects_odd_length_and_non_hex() {
        assert!(parse_hex_bytes(&args(&["123"])).is_err());
        assert!(parse_hex_bytes(&args(&["zz"])).is_err());
        assert!(parse_hex_bytes(&args(&["0x"])).is_err());
        assert!(parse_hex_bytes(&args(&["é1"])).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_input() {
        assert!(parse_hex_bytes(&args(&["  ", ""])).is_err());
        assert!(parse_hex_bytes(&[]).is_err());
    }
}
