use clap::Parser;

use virtrpc::auth::{NoCredentials, StaticCredentials};
use virtrpc::Connection;

/// Connect to a remote management daemon and issue a single RPC, printing
/// the raw reply payload. Exercises the transport/auth/framing/dispatch
/// core end to end without any of the generated per-procedure wrappers
/// that would normally sit on top of it.
#[derive(Parser)]
struct Cli {
    /// Connection URI, e.g. "qemu+tls://host/system" or "test:///default".
    uri: String,

    /// Procedure number to call.
    #[arg(long, default_value_t = 66)]
    procedure: u32,

    /// Payload bytes, hex-encoded.
    #[arg(long, default_value = "")]
    payload: String,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let payload = decode_hex(&args.payload)?;

    let connection = match (args.username, args.password) {
        (Some(username), Some(password)) => Connection::open(&args.uri, &StaticCredentials { username, password })?,
        _ => Connection::open(&args.uri, &NoCredentials)?,
    };

    let reply = connection.call(args.procedure, &payload)?;
    println!("{}", encode_hex(&reply));

    Ok(())
}

fn decode_hex(s: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if s.len() % 2 != 0 {
        return Err("payload must have an even number of hex digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.into()))
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
