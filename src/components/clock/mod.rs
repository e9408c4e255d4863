pub mod frequency_divider;
pub mod frequency_generator;

pub use frequency_divider::FrequencyDivider;
pub use frequency_generator::FrequencyGenerator;
