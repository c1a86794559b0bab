use clap::Parser;

fn main() {
    let cli = apilctl::Cli::parse();
    if let Err(err) = apilctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
