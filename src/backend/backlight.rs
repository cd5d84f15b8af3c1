//! sysfs backlight control

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

/// A backlight device under `/sys/class/backlight`
#[derive(Debug, Clone)]
pub struct Backlight {
    path: PathBuf,
    max_brightness: u32,
}

impl Backlight {
    /// Opens the backlight device `name` below `root`
    ///
    /// Returns `Ok(None)` if the device does not exist.
    pub fn open(root: impl AsRef<Path>, name: &str) -> io::Result<Option<Backlight>> {
        let path = root.as_ref().join(name);
        let max = match fs::read_to_string(path.join("max_brightness")) {
            Ok(max) => max,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(?path, "No backlight device");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let max_brightness = max
            .trim()
            .parse::<u32>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(Backlight { path, max_brightness }))
    }

    /// Highest raw brightness level
    pub fn max_brightness(&self) -> u32 {
        self.max_brightness
    }

    /// Sets the brightness, `0.0..=1.0` mapped onto the raw range
    pub fn set(&self, brightness: f32) -> io::Result<()> {
        let level = (self.max_brightness as f32 * brightness.clamp(0.0, 1.0)).round() as u32;
        fs::write(self.path.join("brightness"), level.to_string()).map_err(|err| {
            warn!(path = ?self.path, level, ?err, "Failed to write backlight level");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Backlight;
    use std::fs;

    #[test]
    fn scales_to_raw_range() {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("panel");
        fs::create_dir(&dev).unwrap();
        fs::write(dev.join("max_brightness"), "255\n").unwrap();

        let backlight = Backlight::open(root.path(), "panel").unwrap().unwrap();
        assert_eq!(backlight.max_brightness(), 255);
        backlight.set(0.5).unwrap();
        assert_eq!(fs::read_to_string(dev.join("brightness")).unwrap(), "128");
        backlight.set(3.0).unwrap();
        assert_eq!(fs::read_to_string(dev.join("brightness")).unwrap(), "255");
    }

    #[test]
    fn missing_device_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(Backlight::open(root.path(), "none").unwrap().is_none());
    }
}
