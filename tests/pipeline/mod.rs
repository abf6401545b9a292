mod consumer_tests;
mod delivery_tests;
