pub mod hibernation;
