//! A single-host MapReduce execution engine.
//!
//! One coordinator process owns the task table and hands out work over a
//! small RPC surface; any number of worker processes poll for tasks, run the
//! user's map and reduce functions, and exchange intermediate data through
//! the shared filesystem. Worker crashes are tolerated by timeout-based
//! reassignment on the coordinator side.

pub mod mr;
