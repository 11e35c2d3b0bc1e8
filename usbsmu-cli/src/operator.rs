use rust_decimal::Decimal;
use std::io::{self, Write};
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use usbsmu_lib::calibration::Operator;
use usbsmu_lib::{Result, SmuError};

/// Operator at the terminal: prompts on stdout, answers on stdin.
pub struct ConsoleOperator {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleOperator {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn ask(&mut self, prompt: &str) -> Result<String> {
        print!("{prompt}");
        io::stdout().flush()?;
        match self.lines.next_line().await? {
            Some(line) => Ok(line.trim().to_string()),
            None => Err(SmuError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed while waiting for the operator",
            ))),
        }
    }
}

impl Operator for ConsoleOperator {
    async fn confirm(&mut self, prompt: &str) -> Result<bool> {
        loop {
            match self.ask(&format!("{prompt} [y/n]: ")).await?.to_lowercase().as_str() {
                "y" => return Ok(true),
                "n" => return Ok(false),
                _ => {}
            }
        }
    }

    async fn acknowledge(&mut self, instruction: &str) -> Result<()> {
        info!("{instruction}");
        self.ask("Press enter when done: ").await.map(|_| ())
    }

    async fn read_reference(&mut self, prompt: &str) -> Result<Decimal> {
        loop {
            let answer = self.ask(&format!("{prompt}, reference: ")).await?;
            match Decimal::from_str(&answer).or_else(|_| Decimal::from_scientific(&answer)) {
                Ok(value) => return Ok(value),
                Err(e) => warn!(%answer, "Not a number: {e}"),
            }
        }
    }
}
