use clap::Parser;
use owo_colors::OwoColorize;

mod cli;

use cli::op::OpContext;
use cli::Cli;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let ctx = OpContext {
        config_path: args.config.clone(),
    };

    match args.command.execute(&ctx).await {
        Ok(output) => println!("{}", output),
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            std::process::exit(1);
        }
    }
}
