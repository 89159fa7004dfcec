//! IOTool byte-code command constructors.
//!
//! The IOTool firmware speaks short ASCII mnemonics (`sh B0`, `du 996`, ...).
//! Each constructor returns one command line, without the trailing newline;
//! the controller adds that when it writes a command out.

fn join(elements: &[&str]) -> String {
    elements.join(" ")
}

/// Block until `pin` reads high.
pub fn wait_high(pin: &str) -> String {
    join(&["wh", pin])
}

/// Block until `pin` reads low.
pub fn wait_low(pin: &str) -> String {
    join(&["wl", pin])
}

/// Block until `pin` changes state.
pub fn wait_change(pin: &str) -> String {
    join(&["wc", pin])
}

/// Set the debounce quantum for the `wait_*` commands, in microseconds.
pub fn wait_time(time_us: u32) -> String {
    join(&["wt", &time_us.to_string()])
}

/// Read a digital pin.
pub fn read_digital(pin: &str) -> String {
    join(&["rd", pin])
}

/// Read an analog pin.
pub fn read_analog(pin: &str) -> String {
    join(&["ra", pin])
}

/// Sleep for whole milliseconds. The instruction itself costs 15 us.
pub fn delay_ms(delay: u32) -> String {
    join(&["dm", &delay.to_string()])
}

/// Sleep for microseconds (4..=32767). The instruction itself costs 4 us.
pub fn delay_us(delay: u32) -> String {
    join(&["du", &delay.to_string()])
}

/// Start the interval timer.
pub fn timer_begin() -> String {
    "tb".to_string()
}

/// Stop the interval timer and report the elapsed time.
pub fn timer_end() -> String {
    "te".to_string()
}

/// Set PWM duty (0..=255) on `pin`.
pub fn pwm(pin: &str, value: u8) -> String {
    join(&["pm", pin, &value.to_string()])
}

/// Drive `pin` high.
pub fn set_high(pin: &str) -> String {
    join(&["sh", pin])
}

/// Drive `pin` low.
pub fn set_low(pin: &str) -> String {
    join(&["sl", pin])
}

/// Float `pin`.
pub fn set_tristate(pin: &str) -> String {
    join(&["st", pin])
}

/// Transmit a byte to the host.
pub fn char_transmit(byte: u8) -> String {
    join(&["ct", &byte.to_string()])
}

/// Wait for a byte from the host.
pub fn char_receive() -> String {
    "cr".to_string()
}

/// Repeat from program index `index`, `count` times.
pub fn loop_to(index: u32, count: u32) -> String {
    join(&["lo", &index.to_string(), &count.to_string()])
}

/// Jump to program index `index`.
pub fn goto(index: u32) -> String {
    join(&["go", &index.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_render_firmware_mnemonics() {
        assert_eq!(wait_high("B1"), "wh B1");
        assert_eq!(wait_time(20), "wt 20");
        assert_eq!(set_high("B0"), "sh B0");
        assert_eq!(set_low("B0"), "sl B0");
        assert_eq!(pwm("D0", 128), "pm D0 128");
        assert_eq!(delay_ms(33), "dm 33");
        assert_eq!(delay_us(996), "du 996");
        assert_eq!(loop_to(2, 10), "lo 2 10");
    }
}
