pub mod checker;
pub mod use_case;
