mod pump_tests;
