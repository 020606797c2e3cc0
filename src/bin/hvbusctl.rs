use clap::{App, Arg};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8888";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvbusctl")
        .version("0.1.0")
        .about("Client for the heating bus daemon")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Daemon host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Daemon port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("request")
                .help("Request to send, e.g. 'get OUTSIDE_TEMP' or 'cyc BOILER_STATUS'")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);
    let request: Vec<&str> = matches
        .values_of("request")
        .map(Iterator::collect)
        .unwrap_or_default();
    let request = request.join(" ");

    let stream = match TcpStream::connect(format!("{}:{}", host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "{} cannot reach daemon at {}:{}: {}",
                "error:".red().bold(),
                host,
                port,
                e
            );
            std::process::exit(1);
        }
    };

    let (reader, mut writer) = stream.into_split();
    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(reply) => {
            if let Some(rest) = reply.strip_prefix("ok") {
                println!("{}{}", "ok".green().bold(), rest);
            } else if let Some(rest) = reply.strip_prefix("err") {
                eprintln!("{}{}", "err".red().bold(), rest);
                std::process::exit(1);
            } else {
                println!("{}", reply);
            }
        }
        None => {
            eprintln!("{} daemon closed the connection", "error:".red().bold());
            std::process::exit(1);
        }
    }

    Ok(())
}
