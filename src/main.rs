mod cli;

use anyhow::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("imgdoc=info".parse()?),
        )
        .init();

    let args = cli::parse_args(std::env::args().skip(1))?;
    let code = cli::run(args)?;
    std::process::exit(code);
}
