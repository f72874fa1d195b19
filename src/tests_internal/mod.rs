#![cfg(test)]

pub mod column_store_e2e;
pub mod major_round_e2e;
pub mod medium_prohibit_e2e;
pub mod minor_pass_e2e;
