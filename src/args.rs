use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Discover,
    Qr,
}

#[derive(Debug)]
pub struct Args {
    pub mode: Mode,
    pub debug_mode: bool,
    pub timeout_secs: Option<u64>,
}

impl Args {
    pub fn parse() -> Option<Self> {
        Self::parse_from(env::args().skip(1))
    }

    pub fn parse_from(args: impl IntoIterator<Item = String>) -> Option<Self> {
        let mut mode: Option<Mode> = None;
        let mut debug_mode = false;
        let mut timeout_secs: Option<u64> = None;

        for arg in args {
            if arg == "--help" || arg == "-h" {
                print_help();
                return None;
            } else if arg == "--version" || arg == "-v" {
                println!("adb-link v{}", env!("CARGO_PKG_VERSION"));
                return None;
            } else if arg == "--debug" {
                debug_mode = true;
            } else if arg == "discover" {
                mode = Some(Mode::Discover);
            } else if arg == "qr" {
                mode = Some(Mode::Qr);
            } else if let Some(val) = arg.strip_prefix("--timeout=") {
                match val.parse::<u64>() {
                    Ok(secs) => timeout_secs = Some(secs),
                    Err(_) => {
                        eprintln!("❌ Invalid timeout value: {}", val);
                        return None;
                    }
                }
            } else {
                eprintln!("❌ Unknown argument: {}", arg);
                print_help();
                return None;
            }
        }

        Some(Args {
            mode: mode.unwrap_or(Mode::Discover),
            debug_mode,
            timeout_secs,
        })
    }
}

fn print_help() {
    println!("📡 adb-link: wireless ADB discovery and pairing");
    println!();
    println!("USAGE:");
    println!("    adb-link [COMMAND] [FLAGS]");
    println!();
    println!("COMMANDS:");
    println!("    discover            Browse _adb, _adb-tls-pairing and _adb-tls-connect services (default)");
    println!("    qr                  Print a fresh QR pairing payload");
    println!();
    println!("FLAGS:");
    println!("    --timeout=N         Stop discovery after N seconds (default: 10)");
    println!("    --debug             Enable debug logging");
    println!("    --help, -h          Show this help message");
    println!("    --version, -v       Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    adb-link discover --timeout=30");
    println!("    adb-link qr");
    println!("    RUST_LOG=adb_link=debug adb-link discover");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Option<Args> {
        Args::parse_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_to_discover() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.mode, Mode::Discover);
        assert!(!args.debug_mode);
        assert_eq!(args.timeout_secs, None);
    }

    #[test]
    fn parses_flags() {
        let args = parse(&["qr", "--debug", "--timeout=5"]).unwrap();
        assert_eq!(args.mode, Mode::Qr);
        assert!(args.debug_mode);
        assert_eq!(args.timeout_secs, Some(5));
        assert!(parse(&["--timeout=abc"]).is_none());
        assert!(parse(&["bogus"]).is_none());
    }
}
