use std::path::PathBuf;

use mpath_core::config::{DEFAULT_CONFIGFILE, DEFAULT_PIDFILE, DEFAULT_SOCKET};
use mpath_daemon::DaemonOptions;

fn usage() -> ! {
    eprintln!("usage: mpathd [-v level] [-c config] [-s socket] [-p pidfile]");
    std::process::exit(1);
}

fn main() {
    let mut verbosity: i32 = 2;
    let mut config_file = PathBuf::from(DEFAULT_CONFIGFILE);
    let mut socket_name = DEFAULT_SOCKET.to_string();
    let mut pidfile = Some(PathBuf::from(DEFAULT_PIDFILE));

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" => match args.next().and_then(|v| v.parse().ok()) {
                Some(v) => verbosity = v,
                None => usage(),
            },
            "-c" => match args.next() {
                Some(v) => config_file = PathBuf::from(v),
                None => usage(),
            },
            "-s" => match args.next() {
                Some(v) => socket_name = v,
                None => usage(),
            },
            "-p" => match args.next() {
                Some(v) => pidfile = Some(PathBuf::from(v)),
                None => usage(),
            },
            "--no-pidfile" => pidfile = None,
            _ => usage(),
        }
    }

    let level = match verbosity {
        i32::MIN..=0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let opts = DaemonOptions {
        config_file,
        socket_name,
        pidfile,
    };
    if let Err(e) = mpath_daemon::daemon::run(opts) {
        eprintln!("mpathd: {}", e);
        std::process::exit(1);
    }
}
