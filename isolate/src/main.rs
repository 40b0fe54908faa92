use clap::Parser as ClapParser;
use log::LevelFilter;
use std::process;

use isolate::{
    BytecodeBuilder, GuestException, Heap, HeapCreateInfo, Runtime, RuntimeCreateInfo,
    ScaleConfig, Unit, Value,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Guest threads to start
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Fibonacci argument for the first thread; later ones use slightly less
    #[arg(long, default_value_t = 20)]
    depth: i32,

    /// Upper bound of scheduler workers
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of the result queue
    #[arg(long, default_value_t = 2)]
    queue_capacity: i64,

    /// Overrides RUST_LOG
    #[arg(long)]
    log_level: Option<LevelFilter>,
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = cli.log_level {
        logger.filter_level(level);
    }
    logger.init();

    let mut scale = ScaleConfig::default();
    cli.workers.inspect(|&val| scale.max_pool_workers = val.max(1));
    let runtime = Runtime::new(RuntimeCreateInfo {
        heap: HeapCreateInfo::default(),
        scale,
    });

    let mut heap = runtime.open_heap();
    let status = match run(&mut heap, &cli) {
        Ok(()) => 0,
        Err(exc) => {
            eprintln!("uncaught exception: {}", heap.inspect(exc.value()));
            1
        }
    };
    heap.close();
    runtime.shutdown();
    process::exit(status);
}

fn run(heap: &mut Heap, cli: &Cli) -> Result<(), GuestException> {
    let specials = *heap.specials();
    let fib = fib_proc(heap);
    let worker = worker_proc(heap);
    let queue = heap.send(
        &Value::Class(specials.sized_queue),
        "new",
        &[Value::Integer(cli.queue_capacity)],
        None,
    )?;

    let mut threads = Vec::with_capacity(cli.threads);
    for i in 0..cli.threads {
        let n = cli.depth - (i % 4) as i32;
        let args = [worker.clone(), queue.clone(), fib.clone(), Value::Integer(n.into())];
        let thread = heap.send(&Value::Class(specials.thread), "new", &args, None)?;
        let name = heap.new_string(format!("fib({n})"));
        heap.send(&thread, "name=", &[name], None)?;
        threads.push(thread);
    }

    for _ in 0..cli.threads {
        let result = heap.send(&queue, "pop", &[], None)?;
        println!("received {}", heap.inspect(&result));
    }
    for thread in &threads {
        let result = heap.send(thread, "join", &[], None)?;
        let text = heap.send(thread, "to_s", &[], None)?;
        println!("{} -> {}", heap.to_display(&text), heap.inspect(&result));
    }
    let stats = heap.collect(&[]);
    log::debug!("root heap after run: {stats:?}");
    Ok(())
}

fn compile(heap: &mut Heap, arity: u8, selectors: &[&str], code: BytecodeBuilder) -> Value {
    let literals = selectors
        .iter()
        .map(|name| Value::Symbol(heap.intern(name)))
        .collect();
    let unit = heap.add_unit(
        Unit::new(code.into_bytes())
            .with_arity(arity)
            .with_literals(literals),
    );
    heap.new_proc(unit, Vec::new(), None)
}

/// `fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)`
fn fib_proc(heap: &mut Heap) -> Value {
    let mut b = BytecodeBuilder::new();
    b.load_arg(0);
    b.load_smi(2);
    b.send(0, 1);
    let recurse = b.jump_if_false();
    b.load_arg(0);
    b.return_();
    b.bind(recurse);
    for step in [1, 2] {
        b.load_proc();
        b.load_arg(0);
        b.load_smi(step);
        b.send(1, 1);
        b.send(2, 1);
    }
    b.send(3, 1);
    b.return_();
    compile(heap, 1, &["<", "-", "call", "+"], b)
}

/// `|queue, fib, n| queue.push(fib.call(n))`
fn worker_proc(heap: &mut Heap) -> Value {
    let mut b = BytecodeBuilder::new();
    b.load_arg(0);
    b.load_arg(1);
    b.load_arg(2);
    b.send(0, 1);
    b.send(1, 1);
    b.pop();
    b.load_arg(2);
    b.return_();
    compile(heap, 3, &["call", "push"], b)
}
