pub mod acreboot_routes;
pub mod meminfo_routes;
pub mod memtest_routes;
pub mod monitor_routes;
pub mod reboot_routes;
pub mod report_routes;
pub mod server_routes;
