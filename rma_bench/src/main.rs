mod affinity;
mod parquet_out;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use rmaperf::{Clock, MonotonicClock, Role, SessionParams};

#[derive(Parser, Debug)]
#[command(name = "rma_bench")]
#[command(about = "Point-to-point remote memory access benchmark")]
struct Cli {
    /// Server host. Runs as the server when omitted.
    server: Option<String>,

    /// Bytes per request
    #[arg(short = 'b', long, default_value = "2")]
    block_size: usize,

    /// Requests per round, warmup included
    #[arg(short = 'c', long, default_value = "1000")]
    count: usize,

    /// Number of memory regions backing the requests
    #[arg(long, default_value = "1")]
    mr_count: usize,

    /// Number of rounds
    #[arg(short = 'r', long, default_value = "1")]
    repeat: usize,

    /// Leading requests excluded from statistics
    #[arg(short = 'w', long, default_value = "0")]
    warmup: usize,

    /// Operation issued by every request
    #[arg(short = 'v', long, value_enum, default_value = "write")]
    verb: VerbArg,

    #[arg(short = 'm', long, value_enum, default_value = "latency")]
    mode: ModeArg,

    #[arg(short = 'p', long, default_value = "1234")]
    port: u16,

    /// IP type of service of the connection
    #[arg(long, default_value = "0")]
    tos: u8,

    /// Throughput mode signals every N-th request
    #[arg(long, default_value = "64")]
    signal_interval: usize,

    /// Window after the first measured start for the finished count
    #[arg(long, default_value = "180")]
    time_budget_us: u64,

    #[arg(long, value_enum)]
    direction: Option<DirectionArg>,

    /// Debug logging and raw latency dump
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Pin to this core, or to the last core when given without a value
    #[arg(long, num_args = 0..=1)]
    affinity_core: Option<Option<usize>>,

    /// Output parquet file path
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Run the WRITE ping-pong control benchmark instead of a session
    #[arg(long)]
    pingpong: bool,

    /// Timestamp source
    #[arg(long, value_enum, default_value = "monotonic")]
    clock: ClockArg,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum VerbArg {
    Read,
    Write,
    Send,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Latency,
    Throughput,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DirectionArg {
    #[value(name = "1-N")]
    Out,
    #[value(name = "N-1")]
    In,
    #[value(name = "N-N")]
    Both,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ClockArg {
    /// Nanosecond monotonic clock
    Monotonic,
    /// Calibrated time-stamp counter (x86_64 only)
    Tsc,
}

impl Cli {
    fn params(&self) -> SessionParams {
        let verb = match self.verb {
            VerbArg::Read => rmaperf::Verb::Read,
            VerbArg::Write => rmaperf::Verb::Write,
            VerbArg::Send => rmaperf::Verb::Send,
        };
        let mode = match self.mode {
            ModeArg::Latency => rmaperf::Mode::Latency,
            ModeArg::Throughput => rmaperf::Mode::Throughput,
        };
        // Warmup requests come on top of the measured ones in throughput mode.
        let count = match mode {
            rmaperf::Mode::Throughput => self.count + self.warmup,
            rmaperf::Mode::Latency => self.count,
        };

        let mut params = SessionParams::new()
            .with_verb(verb)
            .with_count(count)
            .with_length(self.block_size)
            .with_repeat(self.repeat)
            .with_warmup(self.warmup)
            .with_mr_count(self.mr_count)
            .with_mode(mode)
            .with_signal_interval(self.signal_interval)
            .with_time_budget_us(self.time_budget_us)
            .with_port(self.port)
            .with_tos(self.tos)
            .with_verbose(self.verbose);
        if let Some(direction) = self.direction {
            params = params.with_direction(match direction {
                DirectionArg::Out => rmaperf::Direction::Out,
                DirectionArg::In => rmaperf::Direction::In,
                DirectionArg::Both => rmaperf::Direction::Both,
            });
        }
        params
    }

    fn role(&self) -> Role {
        match &self.server {
            Some(host) => Role::Client { host: host.clone() },
            None => Role::Server,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the selected benchmark and return the process exit status.
fn execute<C: Clock>(cli: &Cli, role: &Role, params: &SessionParams, clock: &C) -> i32 {
    if cli.pingpong {
        match rmaperf::run_pingpong(role, params, clock) {
            Ok(outcome) => {
                write_output(cli, parquet_out::rows_from_pingpong(params, &outcome));
                0
            }
            Err(e) => {
                tracing::error!("ping-pong failed: {}", e);
                1
            }
        }
    } else {
        match rmaperf::run(role, params, clock) {
            Ok(outcome) => {
                write_output(cli, parquet_out::rows_from_session(params, &outcome));
                outcome.exit_status()
            }
            Err(e) => {
                tracing::error!("session failed: {}", e);
                1
            }
        }
    }
}

fn write_output(cli: &Cli, rows: Vec<parquet_out::RequestRow>) {
    let Some(path) = &cli.output else {
        return;
    };
    if let Err(e) = parquet_out::write_parquet(path, &rows) {
        tracing::error!("Error writing parquet: {}", e);
    } else if !rows.is_empty() {
        tracing::info!("Results written to {}", path);
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(core) = cli.affinity_core {
        affinity::pin_current_thread(core);
    }

    let role = cli.role();
    match &role {
        Role::Client { host } => tracing::info!("Running in client mode, server {} ...", host),
        Role::Server => tracing::info!("Running in server mode ..."),
    }
    let params = cli.params();

    let status = match cli.clock {
        ClockArg::Monotonic => execute(&cli, &role, &params, &MonotonicClock::new()),
        #[cfg(target_arch = "x86_64")]
        ClockArg::Tsc => {
            let clock = rmaperf::TscClock::calibrate(rmaperf::clock::TSC_CALIBRATION);
            execute(&cli, &role, &params, &clock)
        }
        #[cfg(not(target_arch = "x86_64"))]
        ClockArg::Tsc => {
            tracing::warn!("TSC clock is x86_64 only, using the monotonic clock");
            execute(&cli, &role, &params, &MonotonicClock::new())
        }
    };

    std::process::exit(status);
}
