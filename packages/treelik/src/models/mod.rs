pub mod branch_rates;
pub mod site_model;
pub mod substitution;
