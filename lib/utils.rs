//! Helper macros for the demonstration binaries.

/// Create a directory and all its parents if it does not already exist.
///
/// Evaluates to `std::io::Result<()>`.
#[macro_export]
macro_rules! mkdir {
    ( $dir:expr ) => {
        {
            let dir: &std::path::Path = $dir.as_ref();
            if dir.is_dir() {
                Ok(())
            } else {
                std::fs::create_dir_all(dir)
            }
        }
    }
}

/// Write a set of named arrays to an `.npz` file.
///
/// Evaluates to `Result<(), Box<dyn std::error::Error + Send + Sync>>`.
///
/// ```ignore
/// write_npz!(
///     outdir.join("profile.npz"),
///     arrays: {
///         "offsets" => &offsets,
///         "intensities" => &intensities,
///     }
/// )?;
/// ```
#[macro_export]
macro_rules! write_npz {
    (
        $filename:expr,
        arrays: { $( $key:literal => $arr:expr ),* $(,)? }
    ) => {
        (|| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let mut npz = ndarray_npy::NpzWriter::new(
                std::fs::File::create($filename)?);
            $( npz.add_array($key, $arr)?; )*
            npz.finish()?;
            Ok(())
        })()
    }
}
