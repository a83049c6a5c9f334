use std::{io::Write, path::Path};

use env_logger::{Builder, Env};

/// This function configures the logging format. The loglevel is also processed
/// here i.e `RUST_LOG=iocore=TRACE` will print all trace!() and higher
/// messages to the console.
///
/// We might want to suppress certain messages, as some of them are redundant,
/// in particular, completion path messages when pollers run hot.
pub fn init(level: &str) {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or(level.to_string()));

    builder.format(|buf, record| {
        let mut level_style = buf.default_level_style(record.level());
        level_style.set_intense(true);
        writeln!(
            buf,
            "[{} {} {}:{}] {}",
            buf.timestamp_nanos(),
            level_style.value(record.level()),
            Path::new(record.file().unwrap_or("unknown"))
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    // tests may initialize the logger more than once
    let _ = builder.try_init();
}
