pub mod flag_elim;
