use clap::Parser;
use robo::cli::{self, Cli, Commands, PaperOptions};
use robo::config::AppConfig;
use robo::domain::InstrumentRules;
use robo::error::Result;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            cli::check_config(&cli.config)
        }
        Commands::Run {
            candles,
            warmup,
            quote_balance,
            price_tick,
            qty_step,
        } => {
            let config = cli::load_config(&cli.config)?;
            init_logging(&config.logging);
            info!(
                config = %cli.config.display(),
                instruments = config.instruments.len(),
                "starting robo"
            );
            let options = PaperOptions {
                candles,
                warmup,
                quote_balance,
                rules: InstrumentRules { price_tick, qty_step },
            };
            cli::run_trading(&config, &options).await
        }
        Commands::Backtest {
            candles,
            instrument,
            periods,
            initial_balance,
            verbose,
            json,
        } => {
            let mut config: AppConfig = cli::load_config(&cli.config)?;
            if let Some(periods) = periods {
                config.backtest.periods = periods;
            }
            if let Some(balance) = initial_balance {
                config.backtest.initial_balance = balance;
            }
            config.backtest.verbose |= verbose;
            if config.backtest.verbose {
                init_logging(&config.logging);
            } else {
                init_logging_simple();
            }
            cli::run_backtest(&config, &candles, &instrument, json).await.map(|_| ())
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "robo exited with an error");
    }
    result
}
