use clap::Parser;
use std::{
    error::Error,
    io::{self, Write},
};

use docwire::{ClientOptions, Command, Database, WriteOptions, prompt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server to connect to, as host:port. Repeat for a server list
    #[arg(long = "host", default_value = "localhost:27017")]
    hosts: Vec<String>,
    /// Database to use
    #[arg(long, default_value = "test")]
    db: String,
    /// Send writes without waiting for the server to acknowledge them
    #[arg(long = "unsafe")]
    unsafe_writes: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let options = ClientOptions::new(&cli.hosts, cli.db)?;
    let write = WriteOptions::safe(!cli.unsafe_writes);

    let database = Database::new();
    runtime.block_on(database.init(options))?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let command = match prompt(stdin.lock(), &mut stdout) {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        if command == Command::Exit {
            break;
        }

        match runtime.block_on(command.execute(&database, write)) {
            Ok(lines) => {
                for line in lines {
                    writeln!(&mut stdout, "{line}")?;
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    runtime.block_on(database.disconnect());
    Ok(())
}
