pub mod guest;
pub mod msr_bitmap;
pub mod processor_data;
pub mod shared_data;
