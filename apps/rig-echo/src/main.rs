//! # rig-echo
//!
//! 回显试验端：按远程传输的字帧格式应答仿真端，
//! 测量响应为试验响应的运动量，`force = stiffness * disp`。
//!
//! ```bash
//! # 接受任意尺寸，处理完一个仿真端后退出
//! rig-echo --port 8090 --stiffness 10000 --once
//!
//! # 只接受 6 自由度，安全通道
//! rig-echo --num-dof 6 --cert site.pem --key site.key
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use expctl_sdk::SizeSpec;
use expctl_sdk::transport::remote::{EchoRig, SiteConnection, SiteListener, SiteStats, tls};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// 无连接时的轮询间隔
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// 回显试验端
#[derive(Parser, Debug)]
#[command(name = "rig-echo")]
#[command(about = "Echo experimental site for hybrid simulation testing", long_about = None)]
#[command(version)]
struct Args {
    /// 监听地址
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, default_value = "8090")]
    port: u16,

    /// 力 = stiffness * disp
    #[arg(long, default_value = "1.0")]
    stiffness: f64,

    /// 只接受该自由度的标准尺寸；缺省时回显仿真端的尺寸
    #[arg(long)]
    num_dof: Option<usize>,

    /// 帧字数下限
    #[arg(long, default_value = "0")]
    data_size: usize,

    /// PEM 证书链（启用安全通道）
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM 私钥
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// 处理完一个仿真端后退出
    #[arg(long)]
    once: bool,

    /// `RUST_LOG` 未设置时的日志级别
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    expctl_sdk::logging::init_with_filter(&args.log_level);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal. Shutting down after the current simulation...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let server = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(
            tls::server_config_from_pem(cert, key).context("Failed to load site certificate")?,
        ),
        _ => None,
    };

    let listener = SiteListener::bind((args.bind.as_str(), args.port))
        .with_context(|| format!("Failed to bind {}:{}", args.bind, args.port))?;
    listener.set_nonblocking(true)?;
    info!(
        "rig-echo listening on {} (stiffness {}, {})",
        listener.local_addr()?,
        args.stiffness,
        if server.is_some() { "secure" } else { "plain" }
    );

    while !shutdown.load(Ordering::SeqCst) {
        let result = match &server {
            Some(config) => match listener.try_accept_tls(config.clone()) {
                Ok(Some(conn)) => Some(serve(conn, &args)),
                Ok(None) => None,
                Err(e) => Some(Err(anyhow::Error::from(e).context("Secure handshake failed"))),
            },
            None => match listener.try_accept()? {
                Some(conn) => Some(serve(conn, &args)),
                None => None,
            },
        };

        match result {
            None => std::thread::sleep(ACCEPT_POLL),
            Some(Ok(stats)) => {
                info!("Simulation finished: {:?}", stats);
                if args.once {
                    break;
                }
            },
            Some(Err(e)) => {
                error!("Simulation failed: {:#}", e);
                if args.once {
                    return Err(e);
                }
            },
        }
    }

    info!("rig-echo stopped");
    Ok(())
}

fn serve<S: Read + Write>(mut conn: SiteConnection<S>, args: &Args) -> Result<SiteStats> {
    let accepted = args.num_dof.map(SizeSpec::for_dof);
    let sizes = conn
        .negotiate(accepted, args.data_size)
        .context("Size negotiation failed")?;
    info!("Serving sizes {:?} ({} words per frame)", sizes, conn.payload_words());

    let mut rig = EchoRig::new(args.stiffness);
    Ok(conn.serve(&mut rig)?)
}
