pub mod db_counts;
pub mod spider;
