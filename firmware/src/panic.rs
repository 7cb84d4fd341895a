use core::panic::PanicInfo;
use defmt::error;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("PANIC: {}", defmt::Display2Format(info));
    esp_hal::system::software_reset()
}
