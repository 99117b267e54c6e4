use pointstream_common::clamp_lod;
use pointstream_stream::Voxel;

/// How much of each voxel a query visits, and whether it may load data to do so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryDensity {
    /// Every point, scaled by the coefficient. Loads.
    #[default]
    Full,
    /// Only what the view already has resident. Never loads.
    View,
    /// What the view has asked for. Loads.
    ViewComplete,
    /// A fraction, or with a coefficient above 1 a point count. Loads.
    Limit,
    /// Spatially uniform: every point regardless of coefficient. Loads.
    Spatial,
}

/// LOD a query visits a voxel at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAmount {
    pub amount: f32,
    /// Data up to `amount` has to be loaded first.
    pub load: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuerySettings {
    density: QueryDensity,
    coeff: f32,
    point_limit: Option<u64>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            density: QueryDensity::Full,
            coeff: 1.0,
            point_limit: None,
        }
    }
}

impl QuerySettings {
    pub fn new(density: QueryDensity, coeff: f32) -> Self {
        let mut settings = Self::default();
        settings.set_density(density, coeff);
        settings
    }

    /// For [`QueryDensity::Limit`] a coefficient above 1 is a point count:
    /// it becomes the point limit and the coefficient drops back to 1.
    pub fn set_density(&mut self, density: QueryDensity, coeff: f32) {
        self.density = density;
        self.coeff = coeff;
        self.point_limit = None;
        if density == QueryDensity::Limit && coeff > 1.0 {
            self.point_limit = Some(coeff as u64);
            self.coeff = 1.0;
        }
    }

    pub fn density(&self) -> QueryDensity {
        self.density
    }

    pub fn coeff(&self) -> f32 {
        self.coeff
    }

    pub fn point_limit(&self) -> Option<u64> {
        self.point_limit
    }

    pub fn load_amount(&self, voxel: &Voxel) -> LoadAmount {
        voxel_load_amount(self.density, self.coeff, voxel)
    }
}

/// LOD `voxel` is visited at under `density`. Loading is skipped when the
/// voxel already holds that LOD.
pub fn voxel_load_amount(density: QueryDensity, coeff: f32, voxel: &Voxel) -> LoadAmount {
    let (current, request) = {
        let data = voxel.lock();
        (data.current_lod(), data.request_lod())
    };
    let (amount, load) = match density {
        QueryDensity::Full | QueryDensity::Limit => (coeff, true),
        QueryDensity::View => (coeff * current.min(request), false),
        QueryDensity::ViewComplete => (coeff * request, true),
        QueryDensity::Spatial => (1.0, true),
    };
    let amount = clamp_lod(amount);
    LoadAmount {
        amount,
        load: load && amount > current,
    }
}
