mod common;
mod engine_test;
mod execution_log_test;
mod selection_test;
