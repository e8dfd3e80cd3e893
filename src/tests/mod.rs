//! Scheduler behaviour tests driven by a manual tick source


mod algorithm_tests;
