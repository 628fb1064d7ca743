use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use microthread::logging::{LogStrategy, Logger};
use microthread::{
  Fault, FaultPolicy, MicroThreadCx, MicroThreadOptions, Scheduler, SchedulerConfig, SignalGate,
};
use tracing::Level;

/// Drive a frame loop of demo scripts and print what happens every tick
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Number of frames to run
  #[arg(short, long, env = "MTX_FRAMES", default_value_t = 60)]
  pub frames: u64,
  /// Number of patrolling scripts
  #[arg(short, long, env = "MTX_SCRIPTS", default_value_t = 8)]
  pub scripts: usize,
  /// Length of a frame in milliseconds
  #[arg(long, default_value_t = 16)]
  pub frame_ms: u64,
  /// Upper bound on resumptions per frame, at least 1
  #[arg(long)]
  pub max_resumes: Option<NonZeroUsize>,
  /// Add a script that fails, and stop the loop when it does
  #[arg(long)]
  pub halt_on_fault: bool,
  /// Write tick reports to this file instead of stderr
  #[arg(long)]
  pub log_file: Option<PathBuf>,
  /// Print scheduler internals
  #[arg(short, long)]
  pub verbose: bool,
}

async fn patrol(cx: MicroThreadCx, door: SignalGate, index: usize) -> Result<(), Fault> {
  for lap in 0.. {
    for _ in 0..(index % 3 + 1) {
      cx.next_tick().await?;
    }
    if lap % 4 == 3 {
      door.wait().await?;
    }
  }
  Ok(())
}

async fn door_keeper(cx: MicroThreadCx, door: SignalGate) -> Result<(), Fault> {
  loop {
    cx.delay(Duration::from_millis(100)).await?;
    let released = door.set();
    println!("[{}] door opened for {released} scripts", cx.tick());
  }
}

async fn loader(cx: MicroThreadCx) -> Result<(), Fault> {
  let bytes = cx
    .run_blocking(|| {
      sleep(Duration::from_millis(40));
      vec![0u8; 4096]
    })
    .await?;
  println!("[{}] loaded {} bytes", cx.tick(), bytes.len());
  Ok(())
}

async fn faulty(cx: MicroThreadCx) -> Result<(), Fault> {
  cx.delay(Duration::from_millis(50)).await?;
  Err(Fault::msg("the faulty script gave up"))
}

pub fn main() -> ExitCode {
  let args = Args::parse();
  if args.verbose {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).with_writer(std::io::stderr).init();
  }
  let logger = Logger::new(match &args.log_file {
    Some(path) => LogStrategy::File(path.clone()),
    None => LogStrategy::StdErr,
  });
  let config = SchedulerConfig {
    max_resumes_per_tick: args.max_resumes,
    fault_policy: if args.halt_on_fault { FaultPolicy::Halt } else { FaultPolicy::Isolate },
  };
  let sched = Scheduler::with_config(config);
  let door = SignalGate::new();
  for index in 0..args.scripts {
    let door = door.clone();
    let opts = MicroThreadOptions::new(index as i64 % 4).named(format!("patrol{index}"));
    sched.add_with(opts, move |cx| patrol(cx, door, index));
  }
  let keeper = door.clone();
  sched.add_with(MicroThreadOptions::new(-1).named("door"), move |cx| door_keeper(cx, keeper));
  sched.add_with(MicroThreadOptions::new(10).named("loader"), loader);
  if args.halt_on_fault {
    sched.add_with(MicroThreadOptions::new(10).named("faulty"), faulty);
  }
  let mut code = ExitCode::SUCCESS;
  for _ in 0..args.frames {
    match sched.run_tick() {
      Ok(report) =>
        if let Err(e) = logger.report(&report) {
          eprintln!("failed to write a tick report: {e}");
          code = ExitCode::FAILURE;
          break;
        },
      Err(e) => {
        eprintln!("frame loop halted: {e}");
        code = ExitCode::FAILURE;
        break;
      },
    }
    sleep(Duration::from_millis(args.frame_ms));
  }
  match sched.teardown() {
    Ok(left) => println!("{} ticks, {} microthreads canceled at teardown", sched.tick(), left.len()),
    Err(e) => {
      eprintln!("teardown failed: {e}");
      code = ExitCode::FAILURE;
    },
  }
  code
}
