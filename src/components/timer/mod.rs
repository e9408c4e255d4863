pub mod down_counter;

pub use down_counter::DownCounter;
