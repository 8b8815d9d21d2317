//! Calibrated cube artifact writers
//!
//! Every writer fills a staging directory under the output root and hands it
//! back as a `StagedArtifact`; the orchestrator decides whether it is
//! committed. A failed or abandoned write leaves nothing at the destination.

use crate::core::assembler::CalibratedCube;
use crate::core::orchestrator::{ArtifactSink, ArtifactTarget, StagedArtifact};
use crate::io::envi::{braced, decode_raw_cube, EnviDataType, EnviHeader, Interleave};
use crate::types::{HsiError, HsiResult, QualityMask, RadianceCube, WavelengthAxis};
use ndarray::{Array1, Array2, Array3};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const STAGING_PREFIX: &str = ".hypercal-staging-";

/// Create a staging directory on the same filesystem as the output root
fn staging_dir(output_root: &Path) -> HsiResult<tempfile::TempDir> {
    fs::create_dir_all(output_root)?;
    Ok(tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir_in(output_root)?)
}

fn qa_name(name: &str) -> String {
    format!("{}_qa", name)
}

/// ENVI artifact: float32 BIP radiance plus a u8 quality-mask raster
#[derive(Debug, Clone)]
pub struct EnviCubeWriter {
    output_root: PathBuf,
}

impl EnviCubeWriter {
    pub fn new<P: AsRef<Path>>(output_root: P) -> Self {
        Self {
            output_root: output_root.as_ref().to_path_buf(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Write `cube` as `<name>.img/.hdr` and `<name>_qa.img/.hdr` inside `dir`
    pub fn write_into(&self, cube: &CalibratedCube, dir: &Path, name: &str) -> HsiResult<()> {
        let (lines, samples, bands) = cube.dim();
        log::info!("Writing ENVI cube {} ({} x {} x {})", name, lines, samples, bands);

        let mut image = BufWriter::new(File::create(dir.join(format!("{}.img", name)))?);
        // Standard layout iteration order is (line, sample, band), i.e. BIP
        for value in cube.radiance().iter() {
            image.write_all(&value.to_le_bytes())?;
        }
        image.flush()?;
        image.get_ref().sync_all()?;

        let header = radiance_header(cube);
        fs::write(dir.join(format!("{}.hdr", name)), header.render())?;

        let qa = qa_name(name);
        let mut mask = BufWriter::new(File::create(dir.join(format!("{}.img", qa)))?);
        mask.write_all(cube.quality_mask().as_standard_layout().as_slice().unwrap_or(&[]))?;
        mask.flush()?;
        mask.get_ref().sync_all()?;
        fs::write(dir.join(format!("{}.hdr", qa)), mask_header(cube).render())?;

        Ok(())
    }
}

fn base_header(samples: usize, lines: usize, bands: usize, data_type: EnviDataType, description: &str) -> EnviHeader {
    let mut header = EnviHeader::new();
    header.set("description", braced(description));
    header.set("samples", samples.to_string());
    header.set("lines", lines.to_string());
    header.set("bands", bands.to_string());
    header.set("header offset", "0");
    header.set("file type", "ENVI Standard");
    header.set("data type", data_type.code().to_string());
    header.set("interleave", Interleave::Bip.as_str());
    header.set("byte order", "0");
    header
}

fn radiance_header(cube: &CalibratedCube) -> EnviHeader {
    let (lines, samples, bands) = cube.dim();
    let mut header = base_header(samples, lines, bands, EnviDataType::F32, "hypercal calibrated radiance");
    header.set("wavelength units", "Nanometers");
    let wavelengths: Vec<String> = cube.wavelengths().iter().map(|w| format!("{:.6}", w)).collect();
    header.set("wavelength", format!("{{{}}}", wavelengths.join(", ")));
    for (key, value) in cube.attributes() {
        header.set(key, braced(value));
    }
    header
}

fn mask_header(cube: &CalibratedCube) -> EnviHeader {
    let (lines, samples, _) = cube.dim();
    let mut header = base_header(samples, lines, 1, EnviDataType::U8, "hypercal quality mask");
    header.set("band names", "{quality}");
    header.set("flag values", "{0 valid, 1 saturated, 2 clamped}");
    header
}

impl ArtifactSink for EnviCubeWriter {
    fn stage(&self, cube: &CalibratedCube, target: &ArtifactTarget) -> HsiResult<StagedArtifact> {
        let staging = staging_dir(&self.output_root)?;
        self.write_into(cube, staging.path(), &target.name)?;
        Ok(StagedArtifact::new(staging, self.artifact_location(target)))
    }

    fn artifact_location(&self, target: &ArtifactTarget) -> PathBuf {
        self.output_root.join(target.relative_dir())
    }

    fn format_name(&self) -> &'static str {
        "envi"
    }
}

/// Radiance header of an ENVI artifact directory (the non-`_qa` `.hdr`)
pub fn read_artifact_header<P: AsRef<Path>>(artifact_dir: P) -> HsiResult<EnviHeader> {
    let path = radiance_header_path(artifact_dir.as_ref())?;
    EnviHeader::parse(&fs::read_to_string(path)?)
}

fn radiance_header_path(dir: &Path) -> HsiResult<PathBuf> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_header = path.extension().map_or(false, |e| e == "hdr");
        let is_mask = path
            .file_stem()
            .map_or(false, |s| s.to_string_lossy().ends_with("_qa"));
        if is_header && !is_mask {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| HsiError::InvalidFormat(format!("No radiance header in {}", dir.display())))
}

/// Contents of an ENVI artifact read back from disk
#[derive(Debug, Clone)]
pub struct ArtifactContents {
    pub header: EnviHeader,
    pub radiance: RadianceCube,
    pub quality_mask: QualityMask,
    pub wavelengths: WavelengthAxis,
}

/// Reopen an ENVI artifact written by `EnviCubeWriter`
pub fn read_artifact<P: AsRef<Path>>(artifact_dir: P) -> HsiResult<ArtifactContents> {
    let dir = artifact_dir.as_ref();
    let header_path = radiance_header_path(dir)?;
    let header = EnviHeader::parse(&fs::read_to_string(&header_path)?)?;
    let layout = header.layout()?;
    if layout.data_type != EnviDataType::F32 || layout.interleave != Interleave::Bip {
        return Err(HsiError::InvalidFormat(format!(
            "{} is not a float32 BIP radiance artifact",
            header_path.display()
        )));
    }

    let expected = layout.data_len()?;
    let bytes = fs::read(header_path.with_extension("img"))?;
    if bytes.len() != expected {
        return Err(HsiError::InvalidFormat(format!(
            "Radiance raster holds {} bytes, header describes {}",
            bytes.len(),
            expected
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let radiance = Array3::from_shape_vec((layout.lines, layout.samples, layout.bands), values)
        .map_err(|e| HsiError::InvalidFormat(format!("Radiance raster shape: {}", e)))?;

    let stem = header_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mask_dir_entry = dir.join(format!("{}.hdr", qa_name(&stem)));
    let mask_header = EnviHeader::parse(&fs::read_to_string(&mask_dir_entry)?)?;
    let mask_layout = mask_header.layout()?;
    let mask_bytes = fs::read(mask_dir_entry.with_extension("img"))?;
    let mask_cube = decode_raw_cube(&mask_bytes, &mask_layout)?;
    let quality_mask: Array2<u8> = mask_cube.index_axis(ndarray::Axis(2), 0).mapv(|v| v as u8);

    let wavelengths = Array1::from(header.get_f64_list("wavelength")?.unwrap_or_default());

    Ok(ArtifactContents {
        header,
        radiance,
        quality_mask,
        wavelengths,
    })
}

/// GeoTIFF artifact: one float32 band per wavelength plus a u8 mask raster
#[cfg(feature = "gdal")]
#[derive(Debug, Clone)]
pub struct GeoTiffCubeWriter {
    output_root: PathBuf,
}

#[cfg(feature = "gdal")]
impl GeoTiffCubeWriter {
    pub fn new<P: AsRef<Path>>(output_root: P) -> Self {
        Self {
            output_root: output_root.as_ref().to_path_buf(),
        }
    }

    pub fn write_into(&self, cube: &CalibratedCube, dir: &Path, name: &str) -> HsiResult<()> {
        use gdal::raster::Buffer;
        use gdal::{DriverManager, Metadata};

        let (lines, samples, bands) = cube.dim();
        log::info!("Writing GeoTIFF cube {} ({} x {} x {})", name, lines, samples, bands);

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<f32, _>(
            dir.join(format!("{}.tif", name)),
            samples as isize,
            lines as isize,
            bands as isize,
        )?;
        for (key, value) in cube.attributes() {
            dataset.set_metadata_item(key, value, "")?;
        }
        for b in 0..bands {
            let mut rasterband = dataset.rasterband(b as isize + 1)?;
            let flat: Vec<f32> = cube.radiance().index_axis(ndarray::Axis(2), b).iter().cloned().collect();
            rasterband.write((0, 0), (samples, lines), &Buffer::new((samples, lines), flat))?;
            rasterband.set_metadata_item("wavelength", &format!("{:.6}", cube.wavelengths()[b]), "")?;
        }

        let mut mask = driver.create_with_band_type::<u8, _>(
            dir.join(format!("{}.tif", qa_name(name))),
            samples as isize,
            lines as isize,
            1,
        )?;
        let mut rasterband = mask.rasterband(1)?;
        let flat: Vec<u8> = cube.quality_mask().iter().cloned().collect();
        rasterband.write((0, 0), (samples, lines), &Buffer::new((samples, lines), flat))?;
        Ok(())
    }
}

#[cfg(feature = "gdal")]
impl ArtifactSink for GeoTiffCubeWriter {
    fn stage(&self, cube: &CalibratedCube, target: &ArtifactTarget) -> HsiResult<StagedArtifact> {
        let staging = staging_dir(&self.output_root)?;
        self.write_into(cube, staging.path(), &target.name)?;
        Ok(StagedArtifact::new(staging, self.artifact_location(target)))
    }

    fn artifact_location(&self, target: &ArtifactTarget) -> PathBuf {
        self.output_root.join(target.relative_dir())
    }

    fn format_name(&self) -> &'static str {
        "geotiff"
    }
}
