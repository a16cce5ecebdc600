// THEORY:
// A pose is seven named points on the animal's body. The pose oracle reports
// them as a bare list in a fixed anatomical order; this module gives the list
// names and refuses anything that is not a complete pose. All positions are in
// image coordinates (x right, y down). Turning them into arena coordinates is
// the kinematics module's job.

use crate::error::{FieldError, Result};
use serde::{Deserialize, Serialize};

/// Number of keypoints in one complete pose.
pub const KEYPOINT_COUNT: usize = 7;

/// Body parts in the order the pose oracle reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyPart {
    Nose,
    RightEar,
    LeftEar,
    Neck,
    RightSide,
    LeftSide,
    Tail,
}

impl BodyPart {
    pub const ALL: [BodyPart; KEYPOINT_COUNT] = [
        BodyPart::Nose,
        BodyPart::RightEar,
        BodyPart::LeftEar,
        BodyPart::Neck,
        BodyPart::RightSide,
        BodyPart::LeftSide,
        BodyPart::Tail,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BodyPart::Nose => "nose",
            BodyPart::RightEar => "right_ear",
            BodyPart::LeftEar => "left_ear",
            BodyPart::Neck => "neck",
            BodyPart::RightSide => "right_side",
            BodyPart::LeftSide => "left_side",
            BodyPart::Tail => "tail",
        }
    }
}

/// One complete pose in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeypointSet {
    points: [(i32, i32); KEYPOINT_COUNT],
}

impl KeypointSet {
    pub fn new(points: [(i32, i32); KEYPOINT_COUNT]) -> Self {
        Self { points }
    }

    /// Interprets raw oracle output. An empty list means the animal was not
    /// found in this frame.
    pub fn from_oracle(points: Vec<(i32, i32)>) -> Result<Option<Self>> {
        if points.is_empty() {
            return Ok(None);
        }
        let points: [(i32, i32); KEYPOINT_COUNT] =
            points.try_into().map_err(|rejected: Vec<(i32, i32)>| FieldError::MalformedPose(rejected.len()))?;
        Ok(Some(Self { points }))
    }

    pub fn get(&self, part: BodyPart) -> (i32, i32) {
        self.points[part as usize]
    }

    pub fn points(&self) -> &[(i32, i32); KEYPOINT_COUNT] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = (BodyPart, (i32, i32))> + '_ {
        BodyPart::ALL.iter().map(move |&part| (part, self.get(part)))
    }
}
