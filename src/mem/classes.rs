//! The allocation-size class table and the request router's index hint.
//!
//! 128 classes span 8 bytes to 128 KiB with granularity that widens as the
//! sizes grow: 8-byte steps below 512 B, then power-of-two band steps up
//! to the largest class. Each row is (allocatable bytes, initial group
//! buffer, group buffer limit, class index); group buffers double on each
//! refill until they hit the limit.

use super::small::SlotGroupList;

pub const CLASS_COUNT: usize = 128;

pub static CLASSES: [SlotGroupList; CLASS_COUNT] = [
    SlotGroupList::new(8, 4096, 1048576, 0),
    SlotGroupList::new(16, 4096, 1048576, 1),
    SlotGroupList::new(24, 4096, 1048576, 2),
    SlotGroupList::new(32, 4096, 1048576, 3),
    SlotGroupList::new(40, 8192, 1048576, 4),
    SlotGroupList::new(48, 8192, 1048576, 5),
    SlotGroupList::new(56, 8192, 1048576, 6),
    SlotGroupList::new(64, 12288, 1048576, 7),
    SlotGroupList::new(72, 12288, 1048576, 8),
    SlotGroupList::new(80, 12288, 1048576, 9),
    SlotGroupList::new(88, 12288, 1048576, 10),
    SlotGroupList::new(96, 16384, 1048576, 11),
    SlotGroupList::new(104, 16384, 1048576, 12),
    SlotGroupList::new(112, 16384, 1048576, 13),
    SlotGroupList::new(120, 16384, 1048576, 14),
    SlotGroupList::new(128, 20480, 1048576, 15),
    SlotGroupList::new(136, 20480, 1048576, 16),
    SlotGroupList::new(144, 20480, 1048576, 17),
    SlotGroupList::new(152, 20480, 1048576, 18),
    SlotGroupList::new(160, 24576, 1048576, 19),
    SlotGroupList::new(168, 24576, 1048576, 20),
    SlotGroupList::new(176, 24576, 1048576, 21),
    SlotGroupList::new(184, 24576, 1048576, 22),
    SlotGroupList::new(192, 28672, 1048576, 23),
    SlotGroupList::new(200, 28672, 1048576, 24),
    SlotGroupList::new(208, 28672, 1048576, 25),
    SlotGroupList::new(216, 28672, 1048576, 26),
    SlotGroupList::new(224, 32768, 1048576, 27),
    SlotGroupList::new(232, 32768, 1048576, 28),
    SlotGroupList::new(240, 32768, 1048576, 29),
    SlotGroupList::new(248, 32768, 1048576, 30),
    SlotGroupList::new(256, 36864, 1048576, 31),
    SlotGroupList::new(264, 36864, 1048576, 32),
    SlotGroupList::new(272, 36864, 1048576, 33),
    SlotGroupList::new(280, 36864, 1048576, 34),
    SlotGroupList::new(288, 40960, 1048576, 35),
    SlotGroupList::new(296, 40960, 1048576, 36),
    SlotGroupList::new(304, 40960, 1048576, 37),
    SlotGroupList::new(312, 40960, 1048576, 38),
    SlotGroupList::new(320, 45056, 1048576, 39),
    SlotGroupList::new(328, 45056, 1048576, 40),
    SlotGroupList::new(336, 45056, 1048576, 41),
    SlotGroupList::new(344, 45056, 1048576, 42),
    SlotGroupList::new(352, 49152, 1048576, 43),
    SlotGroupList::new(360, 49152, 1048576, 44),
    SlotGroupList::new(368, 49152, 1048576, 45),
    SlotGroupList::new(376, 49152, 1048576, 46),
    SlotGroupList::new(384, 53248, 1048576, 47),
    SlotGroupList::new(392, 53248, 1048576, 48),
    SlotGroupList::new(400, 53248, 1048576, 49),
    SlotGroupList::new(408, 53248, 1048576, 50),
    SlotGroupList::new(416, 57344, 1048576, 51),
    SlotGroupList::new(424, 57344, 1048576, 52),
    SlotGroupList::new(432, 57344, 1048576, 53),
    SlotGroupList::new(440, 57344, 1048576, 54),
    SlotGroupList::new(448, 61440, 1048576, 55),
    SlotGroupList::new(456, 61440, 1048576, 56),
    SlotGroupList::new(464, 61440, 1048576, 57),
    SlotGroupList::new(472, 61440, 1048576, 58),
    SlotGroupList::new(480, 65536, 1048576, 59),
    SlotGroupList::new(488, 65536, 1048576, 60),
    SlotGroupList::new(496, 65536, 1048576, 61),
    SlotGroupList::new(504, 65536, 1048576, 62),
    SlotGroupList::new(512, 65536, 1048576, 63),
    SlotGroupList::new(576, 65536, 2097152, 64),
    SlotGroupList::new(640, 65536, 2097152, 65),
    SlotGroupList::new(704, 65536, 2097152, 66),
    SlotGroupList::new(768, 65536, 2097152, 67),
    SlotGroupList::new(832, 65536, 2097152, 68),
    SlotGroupList::new(896, 65536, 2097152, 69),
    SlotGroupList::new(960, 65536, 2097152, 70),
    SlotGroupList::new(1024, 65536, 4194304, 71),
    SlotGroupList::new(1152, 77824, 4194304, 72),
    SlotGroupList::new(1280, 86016, 4194304, 73),
    SlotGroupList::new(1408, 94208, 4194304, 74),
    SlotGroupList::new(1536, 102400, 4194304, 75),
    SlotGroupList::new(1664, 110592, 4194304, 76),
    SlotGroupList::new(1792, 118784, 4194304, 77),
    SlotGroupList::new(1920, 126976, 4194304, 78),
    SlotGroupList::new(2048, 135168, 4194304, 79),
    SlotGroupList::new(2304, 151552, 4194304, 80),
    SlotGroupList::new(2560, 167936, 4194304, 81),
    SlotGroupList::new(2816, 184320, 4194304, 82),
    SlotGroupList::new(3072, 200704, 4194304, 83),
    SlotGroupList::new(3328, 217088, 4194304, 84),
    SlotGroupList::new(3584, 233472, 4194304, 85),
    SlotGroupList::new(3840, 249856, 4194304, 86),
    SlotGroupList::new(4096, 266240, 4194304, 87),
    SlotGroupList::new(4608, 299008, 4194304, 88),
    SlotGroupList::new(5120, 331776, 4194304, 89),
    SlotGroupList::new(5632, 364544, 4194304, 90),
    SlotGroupList::new(6144, 397312, 4194304, 91),
    SlotGroupList::new(6656, 430080, 4194304, 92),
    SlotGroupList::new(7168, 462848, 4194304, 93),
    SlotGroupList::new(7680, 495616, 4194304, 94),
    SlotGroupList::new(8192, 528384, 4194304, 95),
    SlotGroupList::new(9216, 528384, 4194304, 96),
    SlotGroupList::new(10240, 528384, 4194304, 97),
    SlotGroupList::new(11264, 528384, 4194304, 98),
    SlotGroupList::new(12288, 528384, 4194304, 99),
    SlotGroupList::new(13312, 528384, 4194304, 100),
    SlotGroupList::new(14336, 528384, 4194304, 101),
    SlotGroupList::new(15360, 528384, 4194304, 102),
    SlotGroupList::new(16384, 528384, 4194304, 103),
    SlotGroupList::new(18432, 593920, 4194304, 104),
    SlotGroupList::new(20480, 659456, 4194304, 105),
    SlotGroupList::new(22528, 724992, 4194304, 106),
    SlotGroupList::new(24576, 790528, 4194304, 107),
    SlotGroupList::new(26624, 856064, 4194304, 108),
    SlotGroupList::new(28672, 921600, 4194304, 109),
    SlotGroupList::new(30720, 987136, 4194304, 110),
    SlotGroupList::new(32768, 1052672, 4194304, 111),
    SlotGroupList::new(36864, 1052672, 4194304, 112),
    SlotGroupList::new(40960, 1052672, 4194304, 113),
    SlotGroupList::new(45056, 1052672, 4194304, 114),
    SlotGroupList::new(49152, 1052672, 4194304, 115),
    SlotGroupList::new(53248, 1052672, 4194304, 116),
    SlotGroupList::new(57344, 1052672, 4194304, 117),
    SlotGroupList::new(61440, 1052672, 4194304, 118),
    SlotGroupList::new(65536, 1052672, 4194304, 119),
    SlotGroupList::new(73728, 1052672, 4194304, 120),
    SlotGroupList::new(81920, 1052672, 4194304, 121),
    SlotGroupList::new(90112, 1052672, 4194304, 122),
    SlotGroupList::new(98304, 1052672, 4194304, 123),
    SlotGroupList::new(106496, 1052672, 4194304, 124),
    SlotGroupList::new(114688, 1052672, 4194304, 125),
    SlotGroupList::new(122880, 1052672, 4194304, 126),
    SlotGroupList::new(131072, 1052672, 4194304, 127),
];

pub fn class_list(idx: usize) -> &'static SlotGroupList {
    &CLASSES[idx]
}

/// First class whose allocatable size could satisfy `needed` bytes; a
/// closed-form inversion of the table bands. Returns `CLASS_COUNT` when
/// `needed` exceeds the largest class.
pub fn class_index_hint(needed: usize) -> usize {
    if needed == 0 {
        return 0;
    }
    if needed <= 512 {
        return (needed - 1) / 8;
    }
    if needed <= 1024 {
        return (needed - (512 + 1)) / 64 + 64;
    }
    if needed <= 2048 {
        return (needed - (1024 + 1)) / 128 + 72;
    }
    if needed <= 4096 {
        return (needed - (2048 + 1)) / 256 + 80;
    }
    if needed <= 8192 {
        return (needed - (4096 + 1)) / 512 + 88;
    }
    if needed <= 16384 {
        return (needed - (8192 + 1)) / 1024 + 96;
    }
    if needed <= 32768 {
        return (needed - (16384 + 1)) / 2048 + 104;
    }
    if needed <= 65536 {
        return (needed - (32768 + 1)) / 4096 + 112;
    }
    if needed <= 131072 {
        return (needed - (65536 + 1)) / 8192 + 120;
    }
    CLASS_COUNT
}
