use env_logger::Builder;
use std::io::Write as _;

/// Initialize process-wide logging.
///
/// Messages at WARN and above are shown by default, as well as INFO
/// messages of the given modules. RUST_LOG overrides this.
///
/// Set RUST_LOG_FORMAT=SYSTEMD to prefix lines with a syslog priority
/// instead of a timestamp, when running under systemd.
pub fn init(info_modules: &[&str]) {
    let mut builder = Builder::new();
    if std::env::var("RUST_LOG_FORMAT").is_ok_and(|f| f == "SYSTEMD") {
        systemd_format(&mut builder);
    }

    builder.filter_level(log::LevelFilter::Warn);
    for module in info_modules {
        builder.filter_module(module, log::LevelFilter::Info);
    }
    builder.parse_default_env();
    builder.init();
}

fn systemd_format(builder: &mut Builder) {
    builder.format(|fmt, record| {
        // RFC 5424 severity
        let priority = match record.level() {
            log::Level::Error => 3,
            log::Level::Warn => 4,
            log::Level::Info => 5,
            log::Level::Debug | log::Level::Trace => 7,
        };
        writeln!(fmt, "<{priority}>{}: {}", record.target(), record.args())
    });
}
