pub mod purpleair;
