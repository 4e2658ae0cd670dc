use std::env;
use std::error::Error;

use relay_core::{AuthStatus, ChatMessage, Credentials, Envelope, TypingNotice, TypingState};
use relay_protocol::{encode_envelope, FrameDecoder};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Where to connect: env override or default.
    let addr = env::var("RELAY_CLIENT_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("Connecting to {}...", addr);
    let stream = TcpStream::connect(&addr).await?;
    println!("Connected.");
    println!("Commands:");
    println!("  /register <user> <password>");
    println!("  /login <user> <password>");
    println!("  /users");
    println!("  /typing <user> [stop]");
    println!("  @<user> <text>");
    println!("Type '/quit' to leave.\n");

    let (read_half, mut write_half) = stream.into_split();
    tokio::spawn(print_incoming(read_half));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "/quit" || trimmed == "/exit" {
            println!("Exiting client.");
            break;
        }

        let env = match parse_command(trimmed) {
            Some(env) => env,
            None => {
                eprintln!("Could not parse command.");
                continue;
            }
        };

        let mut frame = Vec::with_capacity(128);
        encode_envelope(&env, &mut frame)?;
        write_half.write_all(&frame).await?;
    }

    Ok(())
}

fn parse_command(line: &str) -> Option<Envelope> {
    if let Some(rest) = line.strip_prefix('@') {
        let (to, body) = rest.split_once(' ')?;
        return Some(Envelope::Msg(ChatMessage {
            from: String::new(),
            to: to.to_string(),
            body: body.trim().to_string(),
            timestamp: None,
        }));
    }

    let mut parts = line.split_whitespace();
    match parts.next()? {
        "/register" | "/login" => {
            let creds = Credentials {
                username: parts.next()?.to_string(),
                password: parts.next()?.to_string(),
            };
            if line.starts_with("/register") {
                Some(Envelope::Register(creds))
            } else {
                Some(Envelope::Login(creds))
            }
        }
        "/users" => Some(Envelope::GetUsers),
        "/typing" => {
            let to = parts.next()?.to_string();
            let status = match parts.next() {
                Some("stop") => TypingState::Stop,
                _ => TypingState::Start,
            };
            Some(Envelope::Typing(TypingNotice {
                from: String::new(),
                to,
                status,
            }))
        }
        _ => None,
    }
}

async fn print_incoming(mut read_half: OwnedReadHalf) {
    let mut decoder = FrameDecoder::default();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                println!("<< server closed the connection");
                std::process::exit(0);
            }
            Ok(n) => n,
            Err(e) => {
                eprintln!("Read error: {:?}", e);
                std::process::exit(1);
            }
        };

        for env in decoder.feed(&chunk[..n]) {
            match env {
                Envelope::AuthReply(reply) => {
                    let tag = match reply.status {
                        AuthStatus::Ok => "ok",
                        AuthStatus::Error => "error",
                    };
                    println!("<< [{}] {}", tag, reply.message);
                }
                Envelope::UserList(list) => {
                    let users: Vec<_> = list
                        .users
                        .iter()
                        .map(|(name, status)| format!("{} ({})", name, status.as_str()))
                        .collect();
                    println!("<< users: {}", users.join(", "));
                }
                Envelope::Msg(msg) => {
                    let ts = msg.timestamp.unwrap_or_default();
                    println!("<< [{}] {}: {}", ts, msg.from, msg.body);
                }
                Envelope::Typing(notice) => match notice.status {
                    TypingState::Start => println!("<< {} is typing...", notice.from),
                    TypingState::Stop => println!("<< {} stopped typing", notice.from),
                },
                Envelope::StatusUpdate(update) => {
                    println!("<< {} is now {}", update.user, update.status.as_str());
                }
                other => println!("<< {:?}", other),
            }
        }
    }
}
