//! Command-line flag parsing (§6.1): `-help`, `-daemon`, `-config <path>`.
//! Hand-rolled rather than built on a flag-parsing crate because the
//! original grammar is single-dash, and unrecognized flags must be
//! swallowed rather than rejected.

#[derive(Debug, Default, Clone)]
pub struct RuntimeOptions {
    pub help: bool,
    pub daemon: bool,
    pub config: Option<String>,
}

impl RuntimeOptions {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> RuntimeOptions {
        let mut options = RuntimeOptions::default();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-help" => options.help = true,
                "-daemon" => options.daemon = true,
                "-config" => options.config = iter.next(),
                _ => {} // unknown flags are ignored
            }
        }

        options
    }
}
