use std::hint::black_box;
use std::time::Instant;

use rankcore::arena::Arena;
use rankcore::graph_io::DType;

fn bench_get_put_cycle(arena: &Arena, batch: i64, n: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..n {
        let io = arena.get(batch).unwrap();
        black_box(&io);
        arena.put(io);
    }
    start.elapsed().as_secs_f64()
}

fn bench_cold_allocation(arena: &Arena, batch: i64, n: usize) -> f64 {
    let start = Instant::now();
    let mut held = Vec::with_capacity(n);
    for _ in 0..n {
        held.push(arena.get(batch).unwrap());
    }
    black_box(&held);
    start.elapsed().as_secs_f64()
}

fn main() {
    println!("rankcore arena bucketing benchmarks");
    println!("====================================\n");

    let arena = Arena::new(
        vec![(0, 16, DType::Float32), (1, 1, DType::Int64)],
        vec![(0, 1)],
    );

    let iterations = 50_000;

    let duration = bench_get_put_cycle(&arena, 64, iterations);
    println!("Pooled get/put cycle (batch=64):");
    println!("  Iterations: {}", iterations);
    println!("  Time: {:.3}s", duration);
    println!("  Throughput: {:.0} cycles/sec\n", iterations as f64 / duration);

    let duration = bench_cold_allocation(&arena, 64, 1_000);
    println!("Cold bucket allocation (batch=64, empty pool):");
    println!("  Iterations: 1000");
    println!("  Time: {:.3}s", duration);
    println!("  Throughput: {:.0} allocs/sec\n", 1_000f64 / duration);

    let duration = bench_get_put_cycle(&arena, 600, 1_000);
    println!("Unpooled allocation (batch=600):");
    println!("  Iterations: 1000");
    println!("  Time: {:.3}s", duration);
    println!("  Throughput: {:.0} cycles/sec\n", 1_000f64 / duration);
}
