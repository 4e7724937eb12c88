use std::{path::Path, sync::OnceLock};

pub const COLOR_VAR: &str = "COLOR";
pub const LOG_SPEC_VAR: &str = "WIKISHELL_LOG";

pub fn should_color() -> bool {
    COLOR.get().is_some_and(|it| *it)
}

#[derive(Debug, Clone)]
pub enum ProcKind {
    Host,
    ContentServer(String),
    View(String),
}
impl std::fmt::Display for ProcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "HOST"),
            Self::ContentServer(workspace) => write!(f, "SERVER @ {workspace}"),
            Self::View(workspace) => write!(f, "VIEW @ {workspace}"),
        }
    }
}

static COLOR: OnceLock<bool> = OnceLock::new();
static PROC_NAME: OnceLock<String> = OnceLock::new();

fn format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &flexi_logger::Record,
) -> Result<(), std::io::Error> {
    let color = should_color();

    let line_display = record.line();
    let line_display = if let Some(line) = &line_display {
        format_args!("{}", *line)
    } else {
        format_args!("?")
    };

    let now_display = now.format("%Y-%m-%d %H:%M:%S");
    let now_display = if color {
        format_args!("\x1b[35m{now_display}\x1b[0m")
    } else {
        format_args!("{now_display}")
    };

    let level = record.level();
    let level_colored;
    let level_display = if color {
        level_colored = flexi_logger::style(level).paint(level.to_string());
        format_args!("{level_colored}")
    } else {
        format_args!("{level}")
    };

    write!(
        w,
        "[{now_display}] {} {level_display} [{}:{line_display}] {}",
        PROC_NAME.get().map_or("?", |it| it.as_str()),
        record.file().unwrap_or("<unknown>"),
        record.args(),
    )
}

/// Starts the process-wide logger. Calling this twice only logs an error.
pub fn init_logger(proc_kind: ProcKind, log_dir: Option<&Path>) {
    let doit = || -> anyhow::Result<()> {
        use flexi_logger::*;

        PROC_NAME
            .set(proc_kind.to_string())
            .map_err(|_| anyhow::anyhow!("Already set"))?;

        let default_level = if cfg!(debug_assertions) {
            "debug"
        } else {
            "info"
        };
        let log_spec = match std::env::var(LOG_SPEC_VAR) {
            Ok(spec) => LogSpecification::parse(&spec)?,
            Err(_) => LogSpecification::parse(default_level)?,
        };

        let logger = Logger::with(log_spec).format(format);
        let logger = match log_dir {
            Some(dir) => logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir)
                        .basename(file_basename(&proc_kind)),
                )
                .o_append(true)
                .duplicate_to_stderr(Duplicate::Warn),
            None => logger.log_to_stderr(),
        };
        std::mem::forget(logger.start()?);

        let hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            log::error!("{info}");
            hook(info);
        }));

        let color = std::env::var(COLOR_VAR);
        let color = match color.as_deref().unwrap_or("auto") {
            "never" | "no" | "off" | "false" => false,
            "always" | "yes" | "on" | "true" => true,
            _ => log_dir.is_none() && std::io::IsTerminal::is_terminal(&std::io::stderr()),
        };
        _ = COLOR.set(color);

        Ok(())
    };
    match doit() {
        Ok(()) => log::info!("Started logger for {proc_kind:?}"),
        Err(err) => eprintln!("Failed to start logger: {err}."),
    }
}

fn file_basename(proc_kind: &ProcKind) -> String {
    match proc_kind {
        ProcKind::Host => "host".into(),
        ProcKind::ContentServer(workspace) => format!("server-{}", sanitize(workspace)),
        ProcKind::View(workspace) => format!("view-{}", sanitize(workspace)),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
