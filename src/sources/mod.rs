pub mod commit;
pub mod enumerate;
pub mod line;
