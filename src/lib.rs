pub mod cli;
pub mod database_ops;
pub mod tracing;

pub mod util {
    pub mod env;
    pub mod proto;
    pub mod sql;
}
