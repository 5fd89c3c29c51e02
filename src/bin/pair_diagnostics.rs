// pair_diagnostics.rs
//
// Push a block of data through a virtual pair and report throughput and
// counters. Usage: pair_diagnostics <bytes> <baud> [options]
// where options is a parameter string such as "emubr=yes,emuoverrun=no".

use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use null_modem::{
    LineControl, NullModem, PortConfig, PortOptions, Side, Transport, TransportError, VirtualPort,
};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format(|buf, record| {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "[{} {}] {}",
            ts,
            record.level(),
            record.args()
        )
    })
    .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!("Usage: {} <bytes> <baud> [options]", args[0]);
        eprintln!("Example: {} 4096 115200 emubr=yes,emuoverrun=no", args[0]);
        std::process::exit(1);
    }

    let total = match args[1].parse::<usize>() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: Invalid byte count '{}' - must be a number", args[1]);
            std::process::exit(1);
        }
    };
    let baud_rate = match args[2].parse::<u32>() {
        Ok(baud) => baud,
        Err(_) => {
            eprintln!("Error: Invalid baud rate '{}' - must be a number", args[2]);
            std::process::exit(1);
        }
    };
    let options = match args.get(3).map(|s| s.parse::<PortOptions>()).transpose() {
        Ok(options) => options.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    info!("options: {}", options);
    let line = LineControl {
        baud_rate,
        ..LineControl::default()
    };
    let config = PortConfig {
        options,
        line,
        ..PortConfig::default()
    };

    if let Err(e) = run(config, total).await {
        error!("diagnostics failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: PortConfig, total: usize) -> Result<(), TransportError> {
    let modem = Arc::new(NullModem::new(config.clone(), config));
    modem.start();

    let a = VirtualPort::open(modem.clone(), Side::A)?;
    let b = VirtualPort::open(modem.clone(), Side::B)?;

    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let start = Instant::now();

    let reader = tokio::spawn(async move {
        let mut received = Vec::with_capacity(expected.len());
        let mut buffer = [0u8; 512];
        while received.len() < expected.len() {
            match b.receive(&mut buffer).await {
                Ok(n) => received.extend_from_slice(&buffer[..n]),
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok((received == expected, received.len()))
    });

    for chunk in payload.chunks(256) {
        a.send(chunk).await?;
    }

    let (intact, received) = match reader.await {
        Ok(result) => result?,
        Err(e) => {
            error!("reader task failed: {}", e);
            return Err(TransportError::Cancelled);
        }
    };
    let elapsed = start.elapsed();

    println!("Transferred {} of {} bytes in {:?}", received, total, elapsed);
    println!("Data intact: {}", intact);
    if elapsed > Duration::ZERO {
        println!(
            "Throughput: {:.1} bytes/s",
            received as f64 / elapsed.as_secs_f64()
        );
    }
    for side in Side::BOTH {
        let stats = modem.with_pair(|pair| pair.stats(side));
        let status = modem.comm_status(side);
        println!(
            "Port {}: transmitted {}, received {}, overrun {}, frames {}, errors {:#x}",
            side,
            stats.transmitted,
            stats.received,
            stats.overrun,
            stats.sent_frames,
            status.errors.bits()
        );
    }

    drop(a);
    modem.stop();
    Ok(())
}
