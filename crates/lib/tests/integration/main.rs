mod common;

mod concurrency_tests;
mod failure_tests;
mod incremental_tests;
