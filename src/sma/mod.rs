pub mod decoder;
pub mod exchange;
pub mod inverter;
pub mod lri;
pub mod packet;
pub mod records;
