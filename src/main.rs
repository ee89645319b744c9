use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use traffic_threads::simulation::{LightTimings, MotionTimings, SimConfig, Simulation};

#[derive(Parser)]
#[command(name = "traffic_threads")]
#[command(about = "Thread-per-actor traffic simulation")]
struct Cli {
    /// Number of cars
    #[arg(long, default_value = "10")]
    cars: usize,

    /// Number of trucks
    #[arg(long, default_value = "2")]
    trucks: usize,

    /// Number of pedestrians
    #[arg(long, default_value = "5")]
    pedestrians: usize,

    /// Grid width in cells
    #[arg(long, default_value = "15")]
    width: i32,

    /// Grid height in cells
    #[arg(long, default_value = "15")]
    height: i32,

    /// Green phase in milliseconds
    #[arg(long, default_value = "5000")]
    green_ms: u64,

    /// Yellow phase in milliseconds
    #[arg(long, default_value = "2000")]
    yellow_ms: u64,

    /// Red phase in milliseconds
    #[arg(long, default_value = "5000")]
    red_ms: u64,

    /// Time a vehicle spends on each node, in milliseconds
    #[arg(long, default_value = "750")]
    step_ms: u64,

    /// Seconds to run before stopping
    #[arg(long, default_value = "30")]
    seconds: u64,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Route light requests through the loopback registry
    #[arg(long)]
    distributed: bool,

    /// Registry port for distributed mode
    #[arg(long, default_value = "1099")]
    port: u16,
}

impl Cli {
    fn config(&self) -> SimConfig {
        SimConfig {
            cars: self.cars,
            trucks: self.trucks,
            pedestrians: self.pedestrians,
            grid_width: self.width,
            grid_height: self.height,
            lights: LightTimings::new(
                Duration::from_millis(self.green_ms),
                Duration::from_millis(self.yellow_ms),
                Duration::from_millis(self.red_ms),
            ),
            motion: MotionTimings {
                step: Duration::from_millis(self.step_ms),
                ..MotionTimings::default()
            },
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut sim = Simulation::initialize(cli.config())?;
    if cli.distributed {
        sim.connect_distributed(cli.port)?;
    }

    println!("Initial state:");
    sim.print_summary();
    println!();

    sim.start()?;
    for second in 1..=cli.seconds {
        if sim.wait_until_idle(Duration::from_secs(1)) {
            println!("All actors finished after {}s", second);
            break;
        }
        println!("--- After {}s ---", second);
        sim.print_summary();
        println!();
    }

    sim.stop();
    println!("=== Final State ===");
    sim.print_summary();

    if cli.distributed {
        sim.disconnect_distributed();
    }
    Ok(())
}
