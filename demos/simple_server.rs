//! Simple MJPEG server example with a synthetic animated source
//!
//! Run with: cargo run --example simple_server [PORT]
//!
//! Examples:
//!   cargo run --example simple_server          # serves on 0.0.0.0:8080
//!   cargo run --example simple_server 8090     # serves on 0.0.0.0:8090
//!
//! ## Viewing
//!
//! Browser:
//!   http://localhost:8080/
//!
//! With ffplay:
//!   ffplay http://localhost:8080/stream.mjpeg
//!
//! With VLC:
//!   vlc http://localhost:8080/stream.mjpeg
//!
//! Requesting http://localhost:8080/start-stop pauses or resumes the source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mjpeg_rs::{
    frame_channel, ActionRequest, Frame, FrameSender, MjpegServer, PixelFormat, ServerConfig,
    ServerEvent,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const FPS: u64 = 15;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>MJPEG stream</title></head>
<body style="margin:0;background:#000">
<img src="/stream.mjpeg" style="width:100%;height:auto" alt="stream">
</body>
</html>
"#;

/// Moving gradient with a bouncing bar
fn render(tick: u64) -> Frame {
    let mut pixels = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
    let bar = (tick * 8 % WIDTH as u64) as u32;

    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            if x.abs_diff(bar) < 12 {
                pixels.extend_from_slice(&[255, 255, 255]);
            } else {
                let r = ((x + tick as u32) % 256) as u8;
                let g = ((y * 255) / HEIGHT) as u8;
                let b = (tick % 256) as u8;
                pixels.extend_from_slice(&[r, g, b]);
            }
        }
    }

    Frame::new(WIDTH, HEIGHT, PixelFormat::Rgb8, pixels)
}

fn spawn_source(frames: FrameSender, paused: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(1000 / FPS));
        let mut tick = 0u64;
        loop {
            ticker.tick().await;
            if paused.load(Ordering::Relaxed) {
                continue;
            }
            let frame = tokio::task::spawn_blocking(move || render(tick)).await;
            if let Ok(frame) = frame {
                frames.send(frame);
            }
            tick += 1;
        }
    });
}

fn print_usage() {
    eprintln!("Usage: simple_server [PORT]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  PORT    Port to listen on (default: 8080)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let port = match args.get(1) {
        Some(port) => match port.parse::<u16>() {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Error: invalid port {:?}: {}", port, e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => 8080,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mjpeg_rs=debug".parse()?)
                .add_directive("simple_server=debug".parse()?),
        )
        .init();

    let (frames, rx) = frame_channel();
    let paused = Arc::new(AtomicBool::new(false));
    spawn_source(frames, Arc::clone(&paused));

    let server = MjpegServer::new(rx);
    let mut events = server.events();

    let config = ServerConfig::default()
        .port(port)
        .jpeg_quality(75)
        .index_html(INDEX_HTML)
        .start_stop_path("/start-stop");

    println!("Starting MJPEG server on port {}", port);
    println!();
    println!("Browser: http://localhost:{}/", port);
    println!("ffplay:  ffplay http://localhost:{}/stream.mjpeg", port);
    println!();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Error(e) => eprintln!("Server error: {}", e),
                ServerEvent::ClientsStatistic(clients) => {
                    let live = clients.iter().filter(|c| c.is_connected()).count();
                    if live > 0 {
                        println!("{} client(s) connected", live);
                    }
                    for client in clients {
                        tracing::trace!(
                            client = %client.id,
                            status = ?client.status,
                            bytes = client.bytes_sent,
                            frames = client.frames_sent,
                            dropped = client.frames_dropped,
                            "Client"
                        );
                    }
                }
                ServerEvent::TrafficStatistic(points) => {
                    if let Some(point) = points.last() {
                        tracing::debug!(
                            kbps = point.bytes_per_second() * 8.0 / 1000.0,
                            "Traffic"
                        );
                    }
                }
                ServerEvent::Action(ActionRequest::StartStop) => {
                    let was_paused = paused.fetch_xor(true, Ordering::Relaxed);
                    println!("Source {}", if was_paused { "resumed" } else { "paused" });
                }
            }
        }
    });

    server
        .run_until(config, async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
