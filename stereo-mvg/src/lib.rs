//! Stereo camera geometry: calibration model and triangulation.
//!
//! Calibration is a read-only input to the pipeline: a 3×4 projection
//! matrix per camera, loaded from a JSON file. World coordinates are in
//! the calibration frame, feet. Triangulation is the standard DLT
//! formulation solved by SVD, scored by reprojection distance.

#![allow(non_snake_case)]

use nalgebra::{Matrix3x4, Matrix4, Point3, Vector4};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, MvgError>;

#[derive(thiserror::Error, Debug)]
pub enum MvgError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("calibration parse error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("SVD did not converge")]
    SvdFailed,
    #[error("triangulated point is degenerate (w ~ 0)")]
    DegeneratePoint,
    #[error("point projects behind the camera")]
    BehindCamera,
}

/// One camera: name plus its 3×4 projection matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub name: String,
    /// Projection matrix rows; maps homogeneous world (ft) to image (px).
    pub projection: [[f64; 4]; 3],
}

impl CameraCalibration {
    pub fn matrix(&self) -> Matrix3x4<f64> {
        Matrix3x4::from_fn(|r, c| self.projection[r][c])
    }

    /// Project a world point to pixel coordinates.
    pub fn project(&self, p: &[f64; 3]) -> Result<(f64, f64)> {
        let P = self.matrix();
        let hw = Vector4::new(p[0], p[1], p[2], 1.0);
        let img = P * hw;
        if img[2] <= 1e-12 {
            return Err(MvgError::BehindCamera);
        }
        Ok((img[0] / img[2], img[1] / img[2]))
    }

    /// Pixel distance between the projection of `p` and an observed point.
    pub fn reprojection_error(&self, p: &[f64; 3], observed: (f64, f64)) -> Result<f64> {
        let (u, v) = self.project(p)?;
        let (du, dv) = (u - observed.0, v - observed.1);
        Ok((du * du + dv * dv).sqrt())
    }

    /// A pinhole camera at `center` (world ft) looking along +y, with
    /// image x parallel to world x and image y pointing down (-z).
    /// Convenient for tests and the simulated rig.
    pub fn pinhole_looking_down_y(
        name: impl Into<String>,
        f: f64,
        cx: f64,
        cy: f64,
        center: [f64; 3],
    ) -> Self {
        // R maps world axes to camera axes: x_cam = x, y_cam = -z,
        // z_cam (depth) = y.
        let R = nalgebra::Matrix3::new(
            1.0, 0.0, 0.0, //
            0.0, 0.0, -1.0, //
            0.0, 1.0, 0.0,
        );
        let K = nalgebra::Matrix3::new(
            f, 0.0, cx, //
            0.0, f, cy, //
            0.0, 0.0, 1.0,
        );
        let C = nalgebra::Vector3::new(center[0], center[1], center[2]);
        let t = -R * C;
        let mut Rt = Matrix3x4::zeros();
        Rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&R);
        Rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
        let P = K * Rt;
        let mut projection = [[0.0; 4]; 3];
        for r in 0..3 {
            for c in 0..4 {
                projection[r][c] = P[(r, c)];
            }
        }
        Self {
            name: name.into(),
            projection,
        }
    }
}

/// Triangulated point together with its reprojection score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangulated {
    pub xyz_ft: [f64; 3],
    /// Mean of the two per-camera reprojection distances, px.
    pub mean_reproj_px: f64,
    /// `1 / (1 + mean_reproj_px)`.
    pub quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    pub left: CameraCalibration,
    pub right: CameraCalibration,
}

impl StereoCalibration {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(path.as_ref())?;
        let rdr = std::io::BufReader::new(f);
        Ok(serde_json::from_reader(rdr)?)
    }

    pub fn to_json_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let f = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), self)?;
        Ok(())
    }

    /// DLT triangulation of one matched pixel pair.
    pub fn triangulate(&self, left_px: (f64, f64), right_px: (f64, f64)) -> Result<Point3<f64>> {
        let Pl = self.left.matrix();
        let Pr = self.right.matrix();

        let mut A = Matrix4::<f64>::zeros();
        A.set_row(0, &(Pl.row(2) * left_px.0 - Pl.row(0)));
        A.set_row(1, &(Pl.row(2) * left_px.1 - Pl.row(1)));
        A.set_row(2, &(Pr.row(2) * right_px.0 - Pr.row(0)));
        A.set_row(3, &(Pr.row(2) * right_px.1 - Pr.row(1)));

        let svd = A.svd(false, true);
        let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
        // Null-space direction: the row of Vᵀ for the smallest singular
        // value, which nalgebra orders last.
        let h = v_t.row(3);
        let w = h[3];
        if w.abs() < 1e-12 {
            return Err(MvgError::DegeneratePoint);
        }
        Ok(Point3::new(h[0] / w, h[1] / w, h[2] / w))
    }

    /// Triangulate and score by mean reprojection distance.
    pub fn triangulate_with_quality(
        &self,
        left_px: (f64, f64),
        right_px: (f64, f64),
    ) -> Result<Triangulated> {
        let p = self.triangulate(left_px, right_px)?;
        let xyz = [p.x, p.y, p.z];
        let el = self.left.reprojection_error(&xyz, left_px)?;
        let er = self.right.reprojection_error(&xyz, right_px)?;
        let mean = 0.5 * (el + er);
        Ok(Triangulated {
            xyz_ft: xyz,
            mean_reproj_px: mean,
            quality: 1.0 / (1.0 + mean),
        })
    }

    /// A synthetic rig for tests and the sim backend: two pinhole cameras
    /// at z = `height`, `baseline_ft` apart in x, behind the plate looking
    /// toward the mound (+y).
    pub fn simple_rig(f: f64, cx: f64, cy: f64, baseline_ft: f64, height: f64) -> Self {
        Self {
            left: CameraCalibration::pinhole_looking_down_y(
                "left",
                f,
                cx,
                cy,
                [-baseline_ft / 2.0, 0.0, height],
            ),
            right: CameraCalibration::pinhole_looking_down_y(
                "right",
                f,
                cx,
                cy,
                [baseline_ft / 2.0, 0.0, height],
            ),
        }
    }
}
