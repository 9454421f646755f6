pub mod numpy;
pub mod pickle;
pub mod pickle_writer;
pub mod record;
