//! Benchmarks for the strand runtime live under `benches/`.
